//! XChaCha20-Poly1305 frame encryption.
//!
//! Each direction of the established channel has its own key and a strictly
//! increasing counter. The 24-byte nonce layout is:
//!
//! ```text
//! [ direction (1) | zeros (15) | counter LE (8) ]
//! ```
//!
//! The protocol header constant is bound in as AAD so frames from a different
//! protocol revision fail authentication.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroize;

use crate::core::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, CodecError, NONCE_DIR_CLIENT, NONCE_DIR_SERVER,
    PROTOCOL_HEADER, SESSION_KEY_SIZE,
};

/// Direction of travel for nonce construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client -> server (0x00).
    ClientToServer,
    /// Server -> client (0x01).
    ServerToClient,
}

impl Direction {
    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::ClientToServer => NONCE_DIR_CLIENT,
            Direction::ServerToClient => NONCE_DIR_SERVER,
        }
    }

    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// A transport key for AEAD operations. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Create a session key from raw bytes.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Construct a 24-byte XChaCha20-Poly1305 nonce.
pub fn construct_nonce(direction: Direction, counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction.as_byte();
    // Bytes 1..16 stay zero.
    nonce[16..24].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt a frame body.
pub fn encrypt(
    key: &SessionKey,
    direction: Direction,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = construct_nonce(direction, counter);

    cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &PROTOCOL_HEADER,
            },
        )
        .map_err(|_| CodecError::EncryptionFailed)
}

/// Decrypt a frame body.
///
/// An authentication failure yields [`CodecError::FrameAuthFailed`]; the
/// caller must surface it, never drop it silently.
pub fn decrypt(
    key: &SessionKey,
    direction: Direction,
    counter: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CodecError::FrameAuthFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = construct_nonce(direction, counter);

    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &PROTOCOL_HEADER,
            },
        )
        .map_err(|_| CodecError::FrameAuthFailed)
}
