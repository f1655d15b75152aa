//! Ephemeral X25519 key exchange for one connection.
//!
//! A small piece of state created once, consumed exactly once, producing
//! a shared secret for the caller to hand to a [`crate::SecureChannel`].

use x25519_dalek::{EphemeralSecret, PublicKey};

/// Per-connection ephemeral key pair.
///
/// The private scalar is generated at construction and consumed the
/// first time [`KeyExchange::derive_shared_key`] is called; a second
/// call is a programmer error and panics, since nothing in AoNET's
/// session state machine is supposed to call it twice.
pub struct KeyExchange {
    private: Option<EphemeralSecret>,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh ephemeral key pair.
    pub fn new() -> Self {
        let private = EphemeralSecret::random();
        let public = PublicKey::from(&private);
        Self { private: Some(private), public }
    }

    /// Our 32-byte raw public key, sent to the peer in a plaintext `HI`.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the private scalar and derive the shared secret with the
    /// peer's 32-byte raw public key.
    ///
    /// The private key is used exactly once to derive a shared key,
    /// then discarded — taking `self.private` enforces that at the
    /// type level.
    pub fn derive_shared_key(&mut self, peer_public: &[u8; 32]) -> [u8; 32] {
        let private = self
            .private
            .take()
            .expect("KeyExchange::derive_shared_key called more than once");
        let peer = PublicKey::from(*peer_public);
        private.diffie_hellman(&peer).to_bytes()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &hex_preview(&self.public.to_bytes()))
            .field("consumed", &self.private.is_none())
            .finish()
    }
}

fn hex_preview(bytes: &[u8; 32]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_handshake_derives_identical_keys() {
        let mut a = KeyExchange::new();
        let mut b = KeyExchange::new();

        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();

        let shared_a = a.derive_shared_key(&b_pub);
        let shared_b = b.derive_shared_key(&a_pub);

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    #[should_panic(expected = "called more than once")]
    fn deriving_twice_panics() {
        let mut a = KeyExchange::new();
        let peer = KeyExchange::new().public_bytes();
        let _ = a.derive_shared_key(&peer);
        let _ = a.derive_shared_key(&peer);
    }
}
