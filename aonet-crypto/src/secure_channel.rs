//! Per-connection symmetric encryption.
//!
//! The shared secret from the X25519 exchange is used verbatim as the
//! AEAD key — no HKDF is applied. This skips domain separation between
//! the key-exchange output and the cipher key; callers that need a
//! derived key should run one over the shared secret before calling
//! [`SecureChannel::initialize`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

const NONCE_LEN: usize = 12;

/// Errors raised by [`SecureChannel::encrypt`]/[`SecureChannel::decrypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// `encrypt`/`decrypt` was called before [`SecureChannel::initialize`].
    NotInitialized,
    /// The AEAD authentication tag did not verify.
    AuthTagFailure,
    /// A ciphertext shorter than the nonce was handed to `decrypt`.
    CiphertextTooShort,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "secure channel has no shared key yet"),
            Self::AuthTagFailure => write!(f, "AEAD authentication failed"),
            Self::CiphertextTooShort => write!(f, "ciphertext shorter than a nonce"),
        }
    }
}

impl std::error::Error for ChannelError {}

enum State {
    Uninitialized,
    Initialized(ChaCha20Poly1305),
}

/// Per-connection secure channel.
///
/// Created before the key is known (§3); transitions exactly once,
/// irreversibly, to initialized once the key-exchange handshake
/// completes. Before that point every `encrypt`/`decrypt` call fails;
/// after, both succeed or fail atomically per call.
pub struct SecureChannel {
    state: State,
}

impl SecureChannel {
    /// Create an uninitialized channel (no shared key yet).
    pub fn new() -> Self {
        Self { state: State::Uninitialized }
    }

    /// True once [`Self::initialize`] has been called.
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Initialized(_))
    }

    /// Set the shared key, deriving the ChaCha20-Poly1305 cipher from it
    /// directly (first 32 bytes, no KDF — see module docs).
    pub fn initialize(&mut self, shared_key: [u8; 32]) {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&shared_key));
        self.state = State::Initialized(cipher);
    }

    /// Encrypt `plaintext`, returning a fresh random 12-byte nonce and
    /// the ciphertext (with appended AEAD tag).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ChannelError> {
        let cipher = match &self.state {
            State::Initialized(c) => c,
            State::Uninitialized => return Err(ChannelError::NotInitialized),
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes).expect("getrandom");
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ChannelError::AuthTagFailure)?;

        Ok((nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt a `(nonce, ciphertext)` pair produced by [`Self::encrypt`].
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let cipher = match &self.state {
            State::Initialized(c) => c,
            State::Uninitialized => return Err(ChannelError::NotInitialized),
        };

        if nonce.len() != NONCE_LEN {
            return Err(ChannelError::CiphertextTooShort);
        }
        let nonce = Nonce::from_slice(nonce);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ChannelError::AuthTagFailure)
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized_channel() -> SecureChannel {
        let mut ch = SecureChannel::new();
        ch.initialize([7u8; 32]);
        ch
    }

    #[test]
    fn round_trip() {
        let ch = initialized_channel();
        let (nonce, ct) = ch.encrypt(b"hello channel").unwrap();
        let pt = ch.decrypt(&nonce, &ct).unwrap();
        assert_eq!(pt, b"hello channel");
    }

    #[test]
    fn operations_fail_before_initialization() {
        let ch = SecureChannel::new();
        assert_eq!(ch.encrypt(b"x").unwrap_err(), ChannelError::NotInitialized);
        assert_eq!(
            ch.decrypt(&[0u8; 12], b"x").unwrap_err(),
            ChannelError::NotInitialized
        );
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let ch = initialized_channel();
        let (nonce, mut ct) = ch.encrypt(b"hello channel").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert_eq!(ch.decrypt(&nonce, &ct).unwrap_err(), ChannelError::AuthTagFailure);
    }

    #[test]
    fn nonces_are_not_reused_across_calls() {
        let ch = initialized_channel();
        let (n1, _) = ch.encrypt(b"a").unwrap();
        let (n2, _) = ch.encrypt(b"a").unwrap();
        assert_ne!(n1, n2);
    }
}
