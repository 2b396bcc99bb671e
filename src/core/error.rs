//! Error types for the TETHER protocol.

use thiserror::Error;

/// Why a session ended.
///
/// Carried in the final `connection.update` event and by
/// [`SessionError::LoggedOut`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller requested a local teardown.
    #[error("connection ended by caller")]
    Ended,

    /// The caller logged out; the server-side session was invalidated.
    #[error("logged out")]
    LoggedOut,

    /// The server rejected the credentials during authentication.
    #[error("authentication rejected by server")]
    AuthFailure,

    /// The transport closed or errored underneath the session.
    #[error("connection lost")]
    ConnectionLost,

    /// The handshake or frame decryption failed; the channel is unusable.
    #[error("cryptographic failure")]
    CryptoFailure,
}

/// Errors from the frame codec and handshake engine.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame operation was attempted before the handshake completed.
    #[error("secure channel not established")]
    NotEstablished,

    /// The handshake failed (tag verification or malformed message).
    ///
    /// Fatal: the connection must close and must not silently retry.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A received frame failed decryption or integrity verification.
    #[error("frame authentication failed")]
    FrameAuthFailed,

    /// Frame encryption failed.
    #[error("frame encryption failed")]
    EncryptionFailed,

    /// A frame body exceeds the 3-byte length prefix.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The per-direction nonce counter overflowed; the channel must close.
    #[error("frame counter exhausted")]
    CounterExhausted,

    /// The codec was used after it was closed.
    #[error("codec closed")]
    Closed,
}

/// Errors from the structured-payload stand-in codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Unexpected end of input while decoding.
    #[error("unexpected end of node data")]
    UnexpectedEof,

    /// A length or count field exceeds its limit.
    #[error("node field too large")]
    FieldTooLarge,

    /// Input continued past the end of a complete node.
    #[error("trailing bytes after node")]
    TrailingBytes,

    /// Text field is not valid UTF-8.
    #[error("invalid utf-8 in node field")]
    InvalidUtf8,
}

/// Top-level session errors returned to callers of the connection handle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid connection setup (unsupported scheme or access mode).
    ///
    /// Permanent, logged-out class: surfaced before any transport connect
    /// attempt and never retried.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// The transport is not open, or closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport reported an error while an operation was in flight.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A query or wait did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A send did not complete within the connect/send timeout.
    #[error("send timed out")]
    SendTimeout,

    /// The session ended for the given reason.
    #[error("session ended: {0}")]
    LoggedOut(DisconnectReason),

    /// Frame codec or handshake failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Structured payload encode/decode failure.
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// I/O error from the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error is fatal to the connection as a whole, as opposed
    /// to local to a single operation.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Codec(CodecError::HandshakeFailed(_))
            | SessionError::Codec(CodecError::FrameAuthFailed)
            | SessionError::Codec(CodecError::CounterExhausted)
            | SessionError::Config(_)
            | SessionError::LoggedOut(_) => true,
            _ => false,
        }
    }
}
