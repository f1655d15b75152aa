//! Error kinds for session, fabric and server operations.
//!
//! Manual `Display`/`Error` impls: no `thiserror`, `From` impls at the
//! boundaries that need them.

use std::fmt;
use std::io;

use aonet_protocol::DecodeError;

/// What went wrong with one protocol-level violation during handshake,
/// authentication or the message loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    ExpectedHi,
    ExpectedAuth,
    EncryptedBeforeKey,
    BadPubkeyLength,
    BadUsername,
    /// A server-only type (`HI`/`AUTH`/`AUTH_OK`/`AUTH_FAIL`/`ONLINE`/
    /// `OFFLINE`) arrived from the client during the message loop.
    UnexpectedServerType,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedHi => write!(f, "expected HI message"),
            Self::ExpectedAuth => write!(f, "expected AUTH message"),
            Self::EncryptedBeforeKey => write!(f, "encrypted traffic before key exchange"),
            Self::BadPubkeyLength => write!(f, "public key payload was not 32 bytes"),
            Self::BadUsername => write!(f, "username shorter than the minimum of 2 characters"),
            Self::UnexpectedServerType => write!(f, "client sent a server-only message type"),
        }
    }
}

/// Everything that can end a [`crate::session::Session`].
#[derive(Debug)]
pub enum SessionError {
    /// The peer closed the transport (EOF on a length prefix or body read).
    TransportClosed,
    /// A read ended after some bytes but before the expected count.
    ShortRead,
    /// The frame codec rejected a record.
    Decode(DecodeError),
    /// The secure channel failed to authenticate a ciphertext.
    DecryptAuthFail,
    /// A structural rule of the handshake/auth/dispatch sequence was broken.
    ProtocolViolation(Violation),
    /// Transport I/O failed outside of the read paths above (e.g. a write).
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportClosed => write!(f, "transport closed"),
            Self::ShortRead => write!(f, "short read"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::DecryptAuthFail => write!(f, "decryption failed authentication"),
            Self::ProtocolViolation(v) => write!(f, "protocol violation: {v}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::TransportClosed
        } else {
            Self::Io(e)
        }
    }
}

impl From<aonet_crypto::ChannelError> for SessionError {
    fn from(e: aonet_crypto::ChannelError) -> Self {
        match e {
            aonet_crypto::ChannelError::NotInitialized => {
                Self::ProtocolViolation(Violation::EncryptedBeforeKey)
            }
            aonet_crypto::ChannelError::AuthTagFailure
            | aonet_crypto::ChannelError::CiphertextTooShort => Self::DecryptAuthFail,
        }
    }
}

/// Errors raised by the server's accept loop.
#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "server I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
