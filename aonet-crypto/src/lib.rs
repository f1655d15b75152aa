//! X25519 key exchange and ChaCha20-Poly1305 secure channel for AoNET
//! connections.
//!
//! Transport-agnostic and sync: bring your own async runtime. This crate
//! only owns key material and cipher state; it never touches a socket.

#![deny(unsafe_code)]

mod key_exchange;
mod secure_channel;

pub use key_exchange::KeyExchange;
pub use secure_channel::{ChannelError, SecureChannel};
