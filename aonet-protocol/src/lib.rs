//! AoNET wire protocol: message framing and the frame codec.
//!
//! Handles:
//! * Message framing (header/body/CRC layout, monotonic message ids)
//! * The outer length-prefix framing every record travels under
//!
//! Transport-agnostic and free of any crypto dependency: bring your own
//! TCP stream and secure channel.

#![deny(unsafe_code)]

pub mod framing;
pub mod message;

pub use message::{decode, encode, next_message_id, DecodeError, Message, MessageType, VERSION};
