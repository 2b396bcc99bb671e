//! Frame codec and handshake engine.
//!
//! Owns the authentication boundary of the channel: no application payload is
//! encoded or accepted before the handshake completes.
//!
//! Wire format on the established channel:
//!
//! ```text
//! [ length (3, big-endian) | ciphertext (length bytes) ]
//! ```
//!
//! Handshake frames use the same length prefix; the very first frame a client
//! sends is additionally preceded by the 4-byte protocol header. The codec
//! reassembles frames from arbitrary transport reads: a frame may arrive
//! split across reads, and one read may carry several frames.

use bytes::{Bytes, BytesMut};

use crate::core::{
    CodecError, FRAME_LEN_SIZE, MAX_FRAME_SIZE, PROTOCOL_HEADER,
};
use crate::crypto::{
    self, Direction, IdentityKeypair, InitiatorHandshake, ResponderHandshake, Role, SessionKey,
    SessionKeys,
};

/// Codec lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    /// Created; no handshake traffic yet.
    Uninitialized,
    /// Handshake in flight; frames carry handshake messages.
    Handshaking,
    /// Transport keys derived; frames carry encrypted payloads.
    Established,
    /// Terminal; all operations fail.
    Closed,
}

enum HandshakeSlot {
    Idle,
    Initiator(InitiatorHandshake),
    Responder(ResponderHandshake),
}

/// Frame codec and handshake engine for one connection.
///
/// Single-writer: encryption order must match wire order, so callers
/// serialize access (the session layer holds it behind a mutex).
pub struct FrameCodec {
    state: CodecState,
    role: Role,
    handshake: HandshakeSlot,
    send_key: Option<SessionKey>,
    recv_key: Option<SessionKey>,
    send_counter: u64,
    recv_counter: u64,
    recv_buf: BytesMut,
    /// Responder side: strip the protocol header from the first bytes.
    expect_header: bool,
}

impl FrameCodec {
    /// Create the client-side codec from the device identity.
    pub fn initiator(identity: &IdentityKeypair) -> Result<Self, CodecError> {
        Ok(Self {
            state: CodecState::Uninitialized,
            role: Role::Initiator,
            handshake: HandshakeSlot::Initiator(InitiatorHandshake::new(identity)?),
            send_key: None,
            recv_key: None,
            send_counter: 0,
            recv_counter: 0,
            recv_buf: BytesMut::new(),
            expect_header: false,
        })
    }

    /// Create a server-side codec.
    ///
    /// Production clients never run this; it exists so both ends of the
    /// channel can be simulated in-process.
    pub fn responder(identity: &IdentityKeypair) -> Result<Self, CodecError> {
        Ok(Self {
            state: CodecState::Handshaking,
            role: Role::Responder,
            handshake: HandshakeSlot::Responder(ResponderHandshake::new(identity)?),
            send_key: None,
            recv_key: None,
            send_counter: 0,
            recv_counter: 0,
            recv_buf: BytesMut::new(),
            expect_header: true,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CodecState {
        self.state
    }

    /// Produce the first handshake message, prefixed with the protocol
    /// header. Transitions to `Handshaking`.
    pub fn start_handshake(&mut self) -> Result<Bytes, CodecError> {
        if self.state != CodecState::Uninitialized {
            return Err(CodecError::HandshakeFailed(
                "handshake already started".into(),
            ));
        }
        let HandshakeSlot::Initiator(hs) = &mut self.handshake else {
            return Err(CodecError::HandshakeFailed("not an initiator".into()));
        };

        let msg = hs.initiate()?;
        self.state = CodecState::Handshaking;

        let mut out = BytesMut::with_capacity(PROTOCOL_HEADER.len() + FRAME_LEN_SIZE + msg.len());
        out.extend_from_slice(&PROTOCOL_HEADER);
        append_frame(&mut out, &msg)?;
        Ok(out.freeze())
    }

    /// Consume the server's handshake reply and produce the final handshake
    /// frame. Derives transport keys and transitions to `Established`.
    ///
    /// Tag verification failure is fatal: the connection must close, and the
    /// handshake must never be silently retried at this layer.
    pub fn process_handshake_response(&mut self, reply: &[u8]) -> Result<Bytes, CodecError> {
        if self.state != CodecState::Handshaking {
            return Err(CodecError::NotEstablished);
        }
        let HandshakeSlot::Initiator(hs) = std::mem::replace(&mut self.handshake, HandshakeSlot::Idle)
        else {
            return Err(CodecError::HandshakeFailed("not an initiator".into()));
        };

        let (last, result) = hs.complete(reply)?;
        self.install_keys(&SessionKeys::derive(&result)?);

        let mut out = BytesMut::with_capacity(FRAME_LEN_SIZE + last.len());
        append_frame(&mut out, &last)?;
        Ok(out.freeze())
    }

    /// Responder side: consume the initiator's first message, produce the
    /// reply frame.
    pub fn process_handshake_init(&mut self, first: &[u8]) -> Result<Bytes, CodecError> {
        if self.state != CodecState::Handshaking {
            return Err(CodecError::NotEstablished);
        }
        let HandshakeSlot::Responder(hs) = &mut self.handshake else {
            return Err(CodecError::HandshakeFailed("not a responder".into()));
        };

        let reply = hs.respond(first)?;
        let mut out = BytesMut::with_capacity(FRAME_LEN_SIZE + reply.len());
        append_frame(&mut out, &reply)?;
        Ok(out.freeze())
    }

    /// Responder side: consume the initiator's final message and establish.
    pub fn process_handshake_finish(&mut self, last: &[u8]) -> Result<(), CodecError> {
        if self.state != CodecState::Handshaking {
            return Err(CodecError::NotEstablished);
        }
        let HandshakeSlot::Responder(hs) = std::mem::replace(&mut self.handshake, HandshakeSlot::Idle)
        else {
            return Err(CodecError::HandshakeFailed("not a responder".into()));
        };

        let result = hs.finalize(last)?;
        self.install_keys(&SessionKeys::derive(&result)?);
        Ok(())
    }

    fn install_keys(&mut self, keys: &SessionKeys) {
        self.send_key = Some(keys.send_key(self.role).clone());
        self.recv_key = Some(keys.recv_key(self.role).clone());
        self.state = CodecState::Established;
    }

    /// Encrypt one payload into a length-prefixed frame.
    ///
    /// Valid only in `Established`.
    pub fn encode_frame(&mut self, payload: &[u8]) -> Result<Bytes, CodecError> {
        if self.state == CodecState::Closed {
            return Err(CodecError::Closed);
        }
        if self.state != CodecState::Established {
            return Err(CodecError::NotEstablished);
        }
        let key = self.send_key.as_ref().ok_or(CodecError::NotEstablished)?;

        let counter = self.send_counter;
        self.send_counter = counter.checked_add(1).ok_or(CodecError::CounterExhausted)?;

        let ciphertext = crypto::encrypt(key, self.send_direction(), counter, payload)?;

        let mut out = BytesMut::with_capacity(FRAME_LEN_SIZE + ciphertext.len());
        append_frame(&mut out, &ciphertext)?;
        Ok(out.freeze())
    }

    /// Feed raw transport bytes and collect every completed frame.
    ///
    /// In `Handshaking` the yielded payloads are raw handshake messages; in
    /// `Established` each frame body is decrypted with the receive key and
    /// counter. A decryption failure surfaces as `FrameAuthFailed` and must
    /// not be dropped silently.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        match self.state {
            CodecState::Closed => return Err(CodecError::Closed),
            CodecState::Uninitialized => return Err(CodecError::NotEstablished),
            _ => {}
        }

        self.recv_buf.extend_from_slice(chunk);

        if self.expect_header && self.recv_buf.len() >= PROTOCOL_HEADER.len() {
            if self.recv_buf[..PROTOCOL_HEADER.len()] != PROTOCOL_HEADER {
                return Err(CodecError::HandshakeFailed("bad protocol header".into()));
            }
            let _ = self.recv_buf.split_to(PROTOCOL_HEADER.len());
            self.expect_header = false;
        }

        let mut frames = Vec::new();
        loop {
            if self.expect_header || self.recv_buf.len() < FRAME_LEN_SIZE {
                break;
            }
            let len = ((self.recv_buf[0] as usize) << 16)
                | ((self.recv_buf[1] as usize) << 8)
                | (self.recv_buf[2] as usize);
            if self.recv_buf.len() < FRAME_LEN_SIZE + len {
                break;
            }
            let _ = self.recv_buf.split_to(FRAME_LEN_SIZE);
            let body = self.recv_buf.split_to(len).freeze();

            if self.state == CodecState::Established {
                let key = self.recv_key.as_ref().ok_or(CodecError::NotEstablished)?;
                let counter = self.recv_counter;
                self.recv_counter = counter.checked_add(1).ok_or(CodecError::CounterExhausted)?;
                let plaintext = crypto::decrypt(key, self.recv_direction(), counter, &body)?;
                frames.push(Bytes::from(plaintext));
            } else {
                frames.push(body);
            }
        }
        Ok(frames)
    }

    /// Close the codec and drop key material. Terminal.
    pub fn close(&mut self) {
        self.state = CodecState::Closed;
        self.handshake = HandshakeSlot::Idle;
        self.send_key = None;
        self.recv_key = None;
        self.recv_buf.clear();
    }

    fn send_direction(&self) -> Direction {
        match self.role {
            Role::Initiator => Direction::ClientToServer,
            Role::Responder => Direction::ServerToClient,
        }
    }

    fn recv_direction(&self) -> Direction {
        self.send_direction().opposite()
    }
}

/// Append `[len(3, BE) | body]` to `out`.
fn append_frame(out: &mut BytesMut, body: &[u8]) -> Result<(), CodecError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let len = body.len() as u32;
    out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    out.extend_from_slice(body);
    Ok(())
}
