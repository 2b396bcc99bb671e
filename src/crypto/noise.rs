//! Noise_XX handshake implementation.
//!
//! The client (initiator) connects without a pinned server static key and
//! learns it during the exchange:
//!
//! ```text
//! Noise_XX(s, rs):
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//! ```
//!
//! After the handshake, both parties derive per-direction transport keys from
//! the handshake hash using HKDF-SHA256.

use hkdf::Hkdf;
use sha2::Sha256;
use snow::{Builder, HandshakeState};
use zeroize::Zeroize;

use crate::core::{CodecError, HASH_SIZE, NOISE_PATTERN, PUBLIC_KEY_SIZE, SESSION_KEY_SIZE};

use super::aead::SessionKey;
use super::keys::IdentityKeypair;

/// HKDF info label for transport key derivation.
const SESSION_KEY_LABEL: &[u8] = b"tether v1 session keys";

/// Result of a completed handshake.
pub struct HandshakeResult {
    /// The handshake hash, input to transport key derivation.
    pub handshake_hash: [u8; HASH_SIZE],
    /// The peer's static public key, learned in-band.
    pub remote_static: [u8; PUBLIC_KEY_SIZE],
}

/// Handshake state machine for the client (initiator).
pub struct InitiatorHandshake {
    state: HandshakeState,
}

impl InitiatorHandshake {
    /// Create a new initiator handshake from the device identity.
    pub fn new(identity: &IdentityKeypair) -> Result<Self, CodecError> {
        let builder = Builder::new(NOISE_PATTERN.parse().unwrap());
        let state = builder
            .local_private_key(identity.private_key())
            .build_initiator()
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state })
    }

    /// Generate the first handshake message (-> e).
    pub fn initiate(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; 65535];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the server's reply (<- e, ee, s, es) and produce the final
    /// message (-> s, se).
    ///
    /// A tag verification failure here is fatal to the connection and must
    /// never be silently retried.
    pub fn complete(mut self, reply: &[u8]) -> Result<(Vec<u8>, HandshakeResult), CodecError> {
        let mut payload = vec![0u8; 65535];
        self.state
            .read_message(reply, &mut payload)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        let mut buf = vec![0u8; 65535];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);

        let result = finish(self.state)?;
        Ok((buf, result))
    }
}

/// Handshake state machine for the server end.
///
/// The client never runs this in production; it exists so both ends of the
/// channel can be simulated in-process.
pub struct ResponderHandshake {
    state: HandshakeState,
}

impl ResponderHandshake {
    /// Create a new responder handshake.
    pub fn new(identity: &IdentityKeypair) -> Result<Self, CodecError> {
        let builder = Builder::new(NOISE_PATTERN.parse().unwrap());
        let state = builder
            .local_private_key(identity.private_key())
            .build_responder()
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state })
    }

    /// Consume the initiator's first message and produce the reply.
    pub fn respond(&mut self, first: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut payload = vec![0u8; 65535];
        self.state
            .read_message(first, &mut payload)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        let mut buf = vec![0u8; 65535];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the initiator's final message and complete the handshake.
    pub fn finalize(mut self, last: &[u8]) -> Result<HandshakeResult, CodecError> {
        let mut payload = vec![0u8; 65535];
        self.state
            .read_message(last, &mut payload)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

        finish(self.state)
    }
}

/// Extract the handshake hash and remote static, then verify completion.
fn finish(state: HandshakeState) -> Result<HandshakeResult, CodecError> {
    let mut handshake_hash = [0u8; HASH_SIZE];
    handshake_hash.copy_from_slice(state.get_handshake_hash());

    let remote = state
        .get_remote_static()
        .ok_or_else(|| CodecError::HandshakeFailed("no remote static key".into()))?;
    let mut remote_static = [0u8; PUBLIC_KEY_SIZE];
    remote_static.copy_from_slice(remote);

    // Transitioning to transport mode verifies the handshake is complete;
    // the snow transport state itself is discarded because frame encryption
    // uses the HKDF-derived keys below.
    state
        .into_transport_mode()
        .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;

    Ok(HandshakeResult {
        handshake_hash,
        remote_static,
    })
}

/// Role on the channel; decides which derived key is used for each direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The connecting client.
    Initiator,
    /// The server end (simulated in tests).
    Responder,
}

/// Per-direction transport keys derived from the Noise handshake.
pub struct SessionKeys {
    /// Key for initiator -> responder frames.
    pub initiator_key: SessionKey,
    /// Key for responder -> initiator frames.
    pub responder_key: SessionKey,
}

impl SessionKeys {
    /// Derive transport keys from the handshake result.
    ///
    /// HKDF-SHA256-Expand with the handshake hash as PRK, split into the two
    /// direction keys.
    pub fn derive(result: &HandshakeResult) -> Result<Self, CodecError> {
        let hk = Hkdf::<Sha256>::from_prk(&result.handshake_hash)
            .map_err(|_| CodecError::HandshakeFailed("key derivation failed".into()))?;

        let mut key_material = [0u8; 64];
        hk.expand(SESSION_KEY_LABEL, &mut key_material)
            .map_err(|_| CodecError::HandshakeFailed("key derivation failed".into()))?;

        let mut initiator_key = [0u8; SESSION_KEY_SIZE];
        let mut responder_key = [0u8; SESSION_KEY_SIZE];
        initiator_key.copy_from_slice(&key_material[..32]);
        responder_key.copy_from_slice(&key_material[32..]);
        key_material.zeroize();

        Ok(Self {
            initiator_key: SessionKey::from_bytes(initiator_key),
            responder_key: SessionKey::from_bytes(responder_key),
        })
    }

    /// Get the send key for the given role.
    pub fn send_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.initiator_key,
            Role::Responder => &self.responder_key,
        }
    }

    /// Get the receive key for the given role.
    pub fn recv_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.responder_key,
            Role::Responder => &self.initiator_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (HandshakeResult, HandshakeResult) {
        let client_id = IdentityKeypair::generate().unwrap();
        let server_id = IdentityKeypair::generate().unwrap();

        let mut initiator = InitiatorHandshake::new(&client_id).unwrap();
        let mut responder = ResponderHandshake::new(&server_id).unwrap();

        let msg1 = initiator.initiate().unwrap();
        let msg2 = responder.respond(&msg1).unwrap();
        let (msg3, client_result) = initiator.complete(&msg2).unwrap();
        let server_result = responder.finalize(&msg3).unwrap();

        (client_result, server_result)
    }

    #[test]
    fn test_handshake_roundtrip() {
        let (client, server) = run_handshake();

        assert_eq!(client.handshake_hash, server.handshake_hash);

        let client_keys = SessionKeys::derive(&client).unwrap();
        let server_keys = SessionKeys::derive(&server).unwrap();

        assert_eq!(
            client_keys.send_key(Role::Initiator).as_bytes(),
            server_keys.recv_key(Role::Responder).as_bytes()
        );
        assert_eq!(
            client_keys.recv_key(Role::Initiator).as_bytes(),
            server_keys.send_key(Role::Responder).as_bytes()
        );
        assert_ne!(
            client_keys.initiator_key.as_bytes(),
            client_keys.responder_key.as_bytes()
        );
    }

    #[test]
    fn test_remote_static_learned_in_band() {
        let client_id = IdentityKeypair::generate().unwrap();
        let server_id = IdentityKeypair::generate().unwrap();

        let mut initiator = InitiatorHandshake::new(&client_id).unwrap();
        let mut responder = ResponderHandshake::new(&server_id).unwrap();

        let msg1 = initiator.initiate().unwrap();
        let msg2 = responder.respond(&msg1).unwrap();
        let (msg3, client_result) = initiator.complete(&msg2).unwrap();
        let server_result = responder.finalize(&msg3).unwrap();

        assert_eq!(&client_result.remote_static, server_id.public_key());
        assert_eq!(&server_result.remote_static, client_id.public_key());
    }

    #[test]
    fn test_corrupted_reply_fails() {
        let client_id = IdentityKeypair::generate().unwrap();
        let server_id = IdentityKeypair::generate().unwrap();

        let mut initiator = InitiatorHandshake::new(&client_id).unwrap();
        let mut responder = ResponderHandshake::new(&server_id).unwrap();

        let msg1 = initiator.initiate().unwrap();
        let mut msg2 = responder.respond(&msg1).unwrap();
        let last = msg2.len() - 1;
        msg2[last] ^= 0xFF;

        assert!(matches!(
            initiator.complete(&msg2),
            Err(CodecError::HandshakeFailed(_))
        ));
    }
}
