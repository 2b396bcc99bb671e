//! # TETHER Protocol
//!
//! **T**ransport **E**ncryption and **T**agged **H**andling of **E**vented
//! **R**equests
//!
//! TETHER is the encrypted transport/session layer of a multi-device
//! messaging client. It owns everything between the raw byte-stream socket
//! and the application: handshake, per-frame encryption, framing, request
//! correlation, event delivery, and connection lifecycle. It provides:
//!
//! - **Security**: Noise XX handshake, per-frame XChaCha20-Poly1305
//! - **Framing**: length-prefixed frames reassembled from arbitrary reads
//! - **Correlation**: tagged request/response over an async channel
//! - **Lifecycle**: connect, authenticate, catch up, keep alive, tear down
//! - **Recovery**: typed failure classes with enforced rate-limit backoff
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and the [`Transport`](core::Transport)
//!   contract
//! - [`crypto`]: key material, handshake, and frame AEAD
//! - [`transport`]: frame codec, endpoint validation, in-memory transport
//! - [`session`]: the stateful [`Client`](session::Client) and its
//!   collaborators
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tether_protocol::prelude::*;
//!
//! # async fn run() -> Result<(), SessionError> {
//! let config = SessionConfig::builder("wss://gateway.example.net/ws").build();
//! let creds = Credentials::generate()?;
//! let (transport, _server_end) = MemoryTransport::pair();
//!
//! let client = Client::new(config, transport, MemoryKeyStore::new(), creds)?;
//! client.add_event_handler(|event| {
//!     if let Event::ConnectionUpdate(update) = event {
//!         println!("connection: {update:?}");
//!     }
//! });
//! client.connect().await?;
//!
//! let reply = client.query(Node::new("iq").with_attr("type", "get")).await?;
//! println!("reply: {reply}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod session;
pub mod transport;

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::core::{DisconnectReason, SessionError, Transport, TransportEvent};
    pub use crate::crypto::IdentityKeypair;
    pub use crate::session::{
        Client, ConnectionUpdate, Credentials, CredsUpdate, Event, KeyStore, MemoryKeyStore, Node,
        SessionConfig, SessionState,
    };
    pub use crate::transport::{ClientMode, Endpoint, FrameCodec, MemoryTransport};
}
