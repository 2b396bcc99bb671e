//! In-memory transport adapter.
//!
//! A paired duplex byte pipe implementing [`Transport`]. Stands in for the
//! external socket so the secured layer can be exercised end to end, and
//! doubles as the test harness transport. Deliveries can be re-chunked to an
//! arbitrary size to exercise frame reassembly, since the real transport
//! preserves no message boundaries either.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::core::{Transport, TransportEvent};

/// Event channel depth for inbound deliveries.
const EVENT_CHANNEL_DEPTH: usize = 64;

struct Shared {
    open: AtomicBool,
    /// 0 = deliver whole writes; otherwise split deliveries into this size.
    chunk_size: AtomicUsize,
    // Latched: a close that lands before the pump is first polled must
    // still be observed.
    shutdown: watch::Sender<bool>,
}

/// One end of an in-memory duplex transport.
pub struct MemoryTransport {
    shared: Arc<Shared>,
    to_peer: mpsc::UnboundedSender<Bytes>,
    from_peer: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl MemoryTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let make = |to_peer, from_peer| MemoryTransport {
            shared: Arc::new(Shared {
                open: AtomicBool::new(false),
                chunk_size: AtomicUsize::new(0),
                shutdown: watch::channel(false).0,
            }),
            to_peer,
            from_peer: std::sync::Mutex::new(Some(from_peer)),
        };

        (make(a_tx, b_rx), make(b_tx, a_rx))
    }

    /// Split inbound deliveries into `size`-byte chunks (0 = whole writes).
    pub fn set_chunk_size(&self, size: usize) {
        self.shared.chunk_size.store(size, Ordering::Relaxed);
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self) -> io::Result<mpsc::Receiver<TransportEvent>> {
        let mut from_peer = self
            .from_peer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "already connected"))?;

        self.shared.open.store(true, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shared.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => {
                        let _ = events_tx.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                    data = from_peer.recv() => match data {
                        Some(bytes) => {
                            let chunk = shared.chunk_size.load(Ordering::Relaxed);
                            if chunk == 0 {
                                if events_tx.send(TransportEvent::Data(bytes)).await.is_err() {
                                    break;
                                }
                            } else {
                                let mut rest = bytes;
                                while !rest.is_empty() {
                                    let take = chunk.min(rest.len());
                                    let piece = rest.split_to(take);
                                    if events_tx.send(TransportEvent::Data(piece)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        None => {
                            shared.open.store(false, Ordering::SeqCst);
                            let _ = events_tx
                                .send(TransportEvent::Closed(Some("peer closed".into())))
                                .await;
                            break;
                        }
                    },
                }
            }
            debug!(target: "transport", "memory transport pump exited");
        });

        Ok(events_rx)
    }

    async fn send(&self, data: Bytes) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not open"));
        }
        self.to_peer
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            self.shared.shutdown.send_replace(true);
        }
    }
}
