//! Core traits for the TETHER protocol.
//!
//! The raw byte-stream socket is an external collaborator; [`Transport`]
//! defines the contract the session layer requires of it.

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Events emitted by a transport after `connect`.
///
/// The transport preserves no message boundaries: `Data` chunks may split or
/// merge wire frames arbitrarily. Framing is entirely the codec's job.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw bytes received from the peer.
    Data(Bytes),

    /// The transport closed, with an optional reason.
    ///
    /// Terminal: no further events follow.
    Closed(Option<String>),
}

/// Contract required of the external byte-stream transport.
///
/// Implementations must be cheap to share across tasks; the session layer
/// calls `send` and `close` concurrently with inbound event delivery.
pub trait Transport: Send + Sync + 'static {
    /// Open the transport and return its inbound event stream.
    ///
    /// Exactly one `TransportEvent::Closed` is delivered after the stream
    /// goes down, whether locally or remotely initiated.
    fn connect(&self) -> impl Future<Output = io::Result<mpsc::Receiver<TransportEvent>>> + Send;

    /// Send raw bytes, resolving once the transport has accepted them.
    fn send(&self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Whether the transport is currently open.
    fn is_open(&self) -> bool;

    /// Close the transport. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
