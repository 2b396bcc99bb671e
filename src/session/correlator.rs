//! Request/response correlation.
//!
//! Outbound requests carry a connection-scoped unique tag; the correlator
//! resolves the matching inbound reply to exactly one registered waiter.
//! Every pending wait settles exactly once - resolution, rejection, or
//! timeout - and is removed from the registry when it does.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::oneshot;

use crate::core::SessionError;

use super::node::Node;

struct WaiterSet {
    tagged: HashMap<String, oneshot::Sender<Node>>,
    untagged: VecDeque<oneshot::Sender<Bytes>>,
    closed: bool,
}

/// Tag generator and pending-wait registry for one connection handle.
///
/// The epoch counter is connection-scoped: two handles never share tag
/// space, and a handle never reuses a tag.
pub struct RequestCorrelator {
    prefix: String,
    epoch: AtomicU64,
    waiters: Mutex<WaiterSet>,
}

impl RequestCorrelator {
    /// Create a correlator with a fresh random tag prefix.
    pub fn new() -> Self {
        let mut prefix_bytes = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut prefix_bytes);

        Self {
            prefix: format!("{:x}.{:x}", prefix_bytes[0], prefix_bytes[1]),
            epoch: AtomicU64::new(0),
            waiters: Mutex::new(WaiterSet {
                tagged: HashMap::new(),
                untagged: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Generate the next message tag: `prefix-epoch`.
    ///
    /// Strictly increasing per connection; the atomic counter is the single
    /// sequence point, so no two calls observe the same epoch.
    pub fn generate_tag(&self) -> String {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, epoch)
    }

    /// Register a pending wait for the reply carrying `tag`.
    pub fn register_tag(&self, tag: &str) -> Result<oneshot::Receiver<Node>, SessionError> {
        let mut set = self.lock();
        if set.closed {
            return Err(SessionError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        set.tagged.insert(tag.to_string(), tx);
        Ok(rx)
    }

    /// Register a pending wait for the next decoded frame, regardless of tag.
    ///
    /// Used for the handshake response, before any tagging scheme exists.
    pub fn register_next(&self) -> Result<oneshot::Receiver<Bytes>, SessionError> {
        let mut set = self.lock();
        if set.closed {
            return Err(SessionError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        set.untagged.push_back(tx);
        Ok(rx)
    }

    /// Remove a tagged wait that timed out. Safe if already settled.
    pub fn unregister(&self, tag: &str) {
        self.lock().tagged.remove(tag);
    }

    /// Offer an inbound node to the waiter registered for its tag.
    ///
    /// Returns `true` when a waiter consumed the node.
    pub fn resolve_tagged(&self, node: &Node) -> bool {
        let Some(tag) = node.id() else { return false };
        let sender = self.lock().tagged.remove(tag);
        match sender {
            Some(tx) => tx.send(node.clone()).is_ok(),
            None => false,
        }
    }

    /// Offer raw frame bytes to the oldest live untagged waiter, if any.
    ///
    /// A waiter whose receiver has been dropped (timed out) hands the
    /// frame back; it goes to the next in line rather than being lost.
    pub fn resolve_next(&self, mut frame: Bytes) -> bool {
        let mut set = self.lock();
        while let Some(tx) = set.untagged.pop_front() {
            match tx.send(frame) {
                Ok(()) => return true,
                Err(rejected) => frame = rejected,
            }
        }
        false
    }

    /// Whether an untagged waiter is currently registered.
    pub fn has_next_waiter(&self) -> bool {
        !self.lock().untagged.is_empty()
    }

    /// Reject every pending wait and refuse new ones.
    ///
    /// Dropping the senders settles each receiver with a closed-channel
    /// error, which callers surface as `ConnectionClosed`.
    pub fn reject_all(&self) {
        let mut set = self.lock();
        set.closed = true;
        set.tagged.clear();
        set.untagged.clear();
    }

    /// Number of pending tagged waits (diagnostics and tests).
    pub fn pending_count(&self) -> usize {
        self.lock().tagged.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaiterSet> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_of(tag: &str) -> u64 {
        tag.rsplit('-').next().unwrap().parse().unwrap()
    }

    #[test]
    fn test_tags_unique_and_increasing() {
        let correlator = RequestCorrelator::new();
        let tags: Vec<String> = (0..100).map(|_| correlator.generate_tag()).collect();

        for window in tags.windows(2) {
            assert_ne!(window[0], window[1]);
            assert!(epoch_of(&window[0]) < epoch_of(&window[1]));
        }
    }

    #[test]
    fn test_prefix_scoped_to_connection() {
        let a = RequestCorrelator::new();
        let b = RequestCorrelator::new();
        // Same epoch, but the prefix keys tags to one handle. Random prefixes
        // can collide; the invariant under test is per-handle uniqueness.
        assert_eq!(epoch_of(&a.generate_tag()), epoch_of(&b.generate_tag()));
    }

    #[tokio::test]
    async fn test_resolve_tagged_settles_waiter() {
        let correlator = RequestCorrelator::new();
        let tag = correlator.generate_tag();
        let rx = correlator.register_tag(&tag).unwrap();

        let reply = Node::new("iq").with_attr("id", tag.clone());
        assert!(correlator.resolve_tagged(&reply));
        assert_eq!(rx.await.unwrap().id(), Some(tag.as_str()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_tag_not_consumed() {
        let correlator = RequestCorrelator::new();
        let _rx = correlator.register_tag("a-1").unwrap();

        assert!(!correlator.resolve_tagged(&Node::new("iq").with_attr("id", "b-9")));
        assert!(!correlator.resolve_tagged(&Node::new("notify")));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_untagged_waiters_fifo() {
        let correlator = RequestCorrelator::new();
        let rx1 = correlator.register_next().unwrap();
        let rx2 = correlator.register_next().unwrap();

        assert!(correlator.resolve_next(Bytes::from_static(b"first")));
        assert!(correlator.resolve_next(Bytes::from_static(b"second")));

        assert_eq!(rx1.await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(rx2.await.unwrap(), Bytes::from_static(b"second"));
        assert!(!correlator.has_next_waiter());
    }

    #[tokio::test]
    async fn test_resolve_next_skips_dead_waiters() {
        let correlator = RequestCorrelator::new();
        let dead = correlator.register_next().unwrap();
        drop(dead);
        let live = correlator.register_next().unwrap();

        assert!(correlator.resolve_next(Bytes::from_static(b"frame")));
        assert_eq!(live.await.unwrap(), Bytes::from_static(b"frame"));
        assert!(!correlator.has_next_waiter());
    }

    #[tokio::test]
    async fn test_reject_all_settles_everything_once() {
        let correlator = RequestCorrelator::new();
        let tag = correlator.generate_tag();
        let rx_tagged = correlator.register_tag(&tag).unwrap();
        let rx_next = correlator.register_next().unwrap();

        correlator.reject_all();

        assert!(rx_tagged.await.is_err());
        assert!(rx_next.await.is_err());
        // Closed registry refuses new waits.
        assert!(matches!(
            correlator.register_tag("x-1"),
            Err(SessionError::ConnectionClosed)
        ));
        assert!(matches!(
            correlator.register_next(),
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_unregister_removes_wait() {
        let correlator = RequestCorrelator::new();
        let tag = correlator.generate_tag();
        let _rx = correlator.register_tag(&tag).unwrap();

        correlator.unregister(&tag);
        assert_eq!(correlator.pending_count(), 0);
        // A late reply finds nothing to resolve.
        assert!(!correlator.resolve_tagged(&Node::new("iq").with_attr("id", tag)));
    }
}
