//! TETHER Protocol - Security Layer
//!
//! Implements the cryptographic building blocks:
//! - Noise_XX handshake via `snow`
//! - HKDF-SHA256 transport key derivation
//! - XChaCha20-Poly1305 per-frame AEAD with per-direction counters
//! - Key types with `Zeroize`

mod aead;
mod keys;
mod noise;

pub use aead::{Direction, SessionKey, construct_nonce, decrypt, encrypt};
pub use keys::{IdentityKeypair, PreKey};
pub use noise::{
    HandshakeResult, InitiatorHandshake, ResponderHandshake, Role, SessionKeys,
};
