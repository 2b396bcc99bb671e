//! X25519 key management.
//!
//! Long-lived identity and prekey material for the TETHER session layer.
//! Ephemeral handshake keys are owned by `snow` inside the handshake state
//! and never leave it.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CodecError, NOISE_PATTERN, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// A static X25519 keypair for long-term device identity.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct IdentityKeypair {
    /// Private key (32 bytes) - zeroized on drop
    private: [u8; PRIVATE_KEY_SIZE],
    /// Public key (32 bytes)
    public: [u8; PUBLIC_KEY_SIZE],
}

impl IdentityKeypair {
    /// Generate a new random identity keypair.
    ///
    /// Uses snow's keypair generation so the key is valid for the fixed
    /// Noise suite.
    pub fn generate() -> Result<Self, CodecError> {
        let builder = snow::Builder::new(NOISE_PATTERN.parse().unwrap());
        let keypair = builder
            .generate_keypair()
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        let mut private = [0u8; PRIVATE_KEY_SIZE];
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        private.copy_from_slice(&keypair.private);
        public.copy_from_slice(&keypair.public);

        Ok(Self { private, public })
    }

    /// Create a keypair from existing key material.
    pub fn from_bytes(private: [u8; PRIVATE_KEY_SIZE], public: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { private, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }
}

impl Drop for IdentityKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &hex_preview(&self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A numbered one-time prekey, as republished after a crypto desync.
#[derive(Clone)]
pub struct PreKey {
    /// Prekey id, unique per device.
    pub id: u32,
    /// Public half, uploaded to the server.
    pub public: [u8; PUBLIC_KEY_SIZE],
    /// Private half, persisted in the key store. Zeroized on drop.
    private: [u8; PRIVATE_KEY_SIZE],
}

impl PreKey {
    /// Generate a fresh prekey with the given id.
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            id,
            public: public.to_bytes(),
            private: secret.to_bytes(),
        }
    }

    /// Get the private key bytes for persistence.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }
}

impl Drop for PreKey {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for PreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKey")
            .field("id", &self.id)
            .field("public", &hex_preview(&self.public))
            .finish()
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let head: String = bytes.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{head}..")
}
