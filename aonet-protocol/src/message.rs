//! AoNET message framing: the wire record format.
//!
//! Layout: `version(1) | type(1) | body_len(4, BE) | msg_id(2, BE) |
//! body(body_len) | crc32(4, BE)`. The CRC covers the header and body
//! (bytes `[0, 8 + body_len)`).
//!
//! This module never touches a [`aonet_crypto::SecureChannel`] — whether
//! `body` is plaintext or `nonce ∥ ciphertext` is a decision made by the
//! caller (the session layer); decoding here is pure.

use std::sync::atomic::{AtomicU32, Ordering};

const HEADER_LEN: usize = 1 + 1 + 4 + 2;
const CHECKSUM_LEN: usize = 4;

/// One of the message types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hi,
    Auth,
    AuthOk,
    AuthFail,
    Text,
    Image,
    Typing,
    Dm,
    Online,
    Offline,
    Sup,
    Adios,
    Shit,
}

impl MessageType {
    /// Map to the 1-byte wire tag.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Hi => 0x01,
            Self::Auth => 0x02,
            Self::AuthOk => 0x03,
            Self::AuthFail => 0x04,
            Self::Text => 0x10,
            Self::Image => 0x11,
            Self::Typing => 0x12,
            Self::Dm => 0x13,
            Self::Online => 0x20,
            Self::Offline => 0x21,
            Self::Sup => 0x30,
            Self::Adios => 0x31,
            Self::Shit => 0xFF,
        }
    }

    /// Parse the 1-byte wire tag, or `None` for an unknown type.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Hi,
            0x02 => Self::Auth,
            0x03 => Self::AuthOk,
            0x04 => Self::AuthFail,
            0x10 => Self::Text,
            0x11 => Self::Image,
            0x12 => Self::Typing,
            0x13 => Self::Dm,
            0x20 => Self::Online,
            0x21 => Self::Offline,
            0x30 => Self::Sup,
            0x31 => Self::Adios,
            0xFF => Self::Shit,
            _ => return None,
        })
    }

    /// `HI` and `AUTH` are the only types allowed to travel unencrypted.
    pub fn allows_plaintext(self) -> bool {
        matches!(self, Self::Hi | Self::Auth)
    }
}

/// Current wire protocol version.
pub const VERSION: u8 = 1;

/// A decoded (or about-to-be-encoded) AoNET record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub msg_type: MessageType,
    pub msg_id: u16,
    pub body: Vec<u8>,
}

/// Errors from [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than `HEADER_LEN + CHECKSUM_LEN` bytes, or the declared
    /// body length runs past the end of the buffer.
    TooShort,
    /// The stored CRC32 did not match the computed one.
    ChecksumMismatch,
    /// The type byte is not one of the known [`MessageType`] values.
    UnknownType,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "record too short to decode"),
            Self::ChecksumMismatch => write!(f, "CRC32 checksum mismatch"),
            Self::UnknownType => write!(f, "unknown message type byte"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Process-wide message-id counter: wraps at 2^16, guarded against races
/// by using an atomic rather than a lock shared with anything else.
static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(0);

/// Allocate the next message id, wrapping modulo 2^16.
pub fn next_message_id() -> u16 {
    (NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed) % 65536) as u16
}

impl Message {
    /// Construct a message with a freshly allocated id.
    pub fn new(msg_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            msg_type,
            msg_id: next_message_id(),
            body,
        }
    }
}

/// Serialize `version`/`msg_type`/`msg_id`/`body` into the wire layout
/// above, with the trailing CRC32.
///
/// `body` is either the raw payload or `nonce ∥ ciphertext`, depending
/// on whether the caller already ran it through a secure channel —
/// this function does not care which.
pub fn encode(version: u8, msg_type: MessageType, msg_id: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    buf.push(version);
    buf.push(msg_type.as_byte());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&msg_id.to_be_bytes());
    buf.extend_from_slice(body);

    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_be_bytes());

    log::trace!(
        "encoded {msg_type:?} id={msg_id} body_len={} total_len={}",
        body.len(),
        buf.len()
    );
    buf
}

/// Parse a single record (without the outer 4-byte frame-length prefix
/// — see [`crate::transport`]) into a [`Message`].
///
/// Pure: touches neither the network nor a secure channel. Succeeds iff
/// (1) the buffer is at least `8 + body_len + 4` bytes, (2) the stored
/// CRC32 matches the one computed over `[0, 8 + body_len)`, and (3) the
/// type byte is known.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(DecodeError::TooShort);
    }

    let version = data[0];
    let type_byte = data[1];
    let body_len = u32::from_be_bytes(data[2..6].try_into().unwrap()) as usize;
    let msg_id = u16::from_be_bytes(data[6..8].try_into().unwrap());

    let checksum_end = HEADER_LEN
        .checked_add(body_len)
        .and_then(|n| n.checked_add(CHECKSUM_LEN))
        .ok_or(DecodeError::TooShort)?;
    if data.len() < checksum_end {
        return Err(DecodeError::TooShort);
    }

    let body_end = HEADER_LEN + body_len;
    let computed = crc32fast::hash(&data[..body_end]);
    let stored = u32::from_be_bytes(data[body_end..checksum_end].try_into().unwrap());
    if computed != stored {
        return Err(DecodeError::ChecksumMismatch);
    }

    let msg_type = MessageType::from_byte(type_byte).ok_or(DecodeError::UnknownType)?;
    let body = data[HEADER_LEN..body_end].to_vec();

    log::trace!("decoded {msg_type:?} id={msg_id} body_len={body_len}");
    Ok(Message { version, msg_type, msg_id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() {
        let encoded = encode(VERSION, MessageType::Text, 42, b"hello");
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.version, VERSION);
        assert_eq!(decoded.msg_type, MessageType::Text);
        assert_eq!(decoded.msg_id, 42);
        assert_eq!(decoded.body, b"hello");
    }

    #[test]
    fn single_bit_flip_in_header_or_body_fails_checksum() {
        let encoded = encode(VERSION, MessageType::Dm, 7, b"alice:hi");
        let checksum_region_end = encoded.len() - CHECKSUM_LEN;
        for i in 0..checksum_region_end {
            let mut tampered = encoded.clone();
            tampered[i] ^= 0x01;
            assert_eq!(decode(&tampered).unwrap_err(), DecodeError::ChecksumMismatch, "byte {i}");
        }
    }

    #[test]
    fn ids_increase_monotonically_mod_65536() {
        let a = Message::new(MessageType::Text, vec![]);
        let b = Message::new(MessageType::Text, vec![]);
        assert_eq!(b.msg_id, (a.msg_id.wrapping_add(1)));
    }

    #[test]
    fn seven_bytes_or_fewer_is_too_short() {
        for len in 0..=7 {
            let buf = vec![0u8; len];
            assert_eq!(decode(&buf).unwrap_err(), DecodeError::TooShort);
        }
    }

    #[test]
    fn declared_body_length_past_buffer_end_fails() {
        // header claims a huge body but the buffer is short.
        let mut buf = vec![VERSION, MessageType::Text.as_byte()];
        buf.extend_from_slice(&1_000_000u32.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(b"short");
        assert_eq!(decode(&buf).unwrap_err(), DecodeError::TooShort);
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut buf = encode(VERSION, MessageType::Text, 1, b"x");
        buf[1] = 0x77;
        // Recompute nothing: this intentionally breaks the checksum too,
        // so assert against either failure mode being raised, and that
        // a genuinely unknown-but-checksum-valid record is UnknownType.
        assert!(matches!(
            decode(&buf).unwrap_err(),
            DecodeError::ChecksumMismatch | DecodeError::UnknownType
        ));
    }

    #[test]
    fn unknown_type_with_valid_checksum_is_unknown_type() {
        let body = b"x";
        let msg_id = 1u16;
        let mut header = vec![VERSION, 0x77];
        header.extend_from_slice(&(body.len() as u32).to_be_bytes());
        header.extend_from_slice(&msg_id.to_be_bytes());
        header.extend_from_slice(body);
        let checksum = crc32fast::hash(&header);
        header.extend_from_slice(&checksum.to_be_bytes());
        assert_eq!(decode(&header).unwrap_err(), DecodeError::UnknownType);
    }
}
