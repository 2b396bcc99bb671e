//! Session event delivery.
//!
//! Handlers are invoked synchronously in registration order. During the
//! connect sequence the bus buffers every emitted event, coalescing
//! consecutive connection updates, and replays the buffer once the
//! session reaches ready - so observers see the pre-ready history in
//! order, but not before catch-up completes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::core::DisconnectReason;

use super::creds::CredsUpdate;

/// Connection lifecycle state as observed through events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connect and handshake in progress.
    Connecting,
    /// Handshake complete, authentication exchange in flight.
    Authenticating,
    /// Authenticated, draining notifications queued while offline.
    CatchingUp,
    /// Fully connected and caught up.
    Ready,
    /// Terminal. The handle cannot be reused.
    Closed,
}

/// Incremental connection status. Fields are `None` when unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    /// Lifecycle transition, if any.
    pub state: Option<SessionState>,
    /// Pairing payload for display, present only during registration.
    pub pairing_ref: Option<String>,
    /// Set once the offline notification queue has been drained.
    pub received_pending_notifications: Option<bool>,
    /// Why the previous connection ended, on the final update.
    pub last_disconnect: Option<DisconnectReason>,
}

impl ConnectionUpdate {
    /// Fold `later` into `self`; set fields in `later` win.
    pub fn merge(&mut self, later: &ConnectionUpdate) {
        if later.state.is_some() {
            self.state = later.state;
        }
        if later.pairing_ref.is_some() {
            self.pairing_ref = later.pairing_ref.clone();
        }
        if later.received_pending_notifications.is_some() {
            self.received_pending_notifications = later.received_pending_notifications;
        }
        if later.last_disconnect.is_some() {
            self.last_disconnect = later.last_disconnect;
        }
    }
}

/// Something the session wants observers to know about.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection lifecycle change.
    ConnectionUpdate(ConnectionUpdate),
    /// Credentials changed and should be persisted.
    CredsUpdate(CredsUpdate),
}

type Handler = std::sync::Arc<dyn Fn(&Event) + Send + Sync>;

struct Registry {
    handlers: Vec<(u64, Handler)>,
    // Some(queue) while buffering; connection updates coalesce in place.
    buffer: Option<Vec<Event>>,
}

/// Dispatches [`Event`]s to registered handlers.
pub struct EventBus {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl EventBus {
    /// Create an empty bus with live dispatch.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                handlers: Vec::new(),
                buffer: None,
            }),
        }
    }

    /// Register a handler; returns an id usable with [`remove_handler`].
    ///
    /// [`remove_handler`]: EventBus::remove_handler
    pub fn add_handler<F>(&self, handler: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().handlers.push((id, std::sync::Arc::new(handler)));
        id
    }

    /// Remove a handler by id. Returns `false` if it was not registered.
    pub fn remove_handler(&self, id: u64) -> bool {
        let mut reg = self.lock();
        let before = reg.handlers.len();
        reg.handlers.retain(|(hid, _)| *hid != id);
        reg.handlers.len() != before
    }

    /// Start buffering emitted events instead of delivering them.
    ///
    /// Idempotent; an armed buffer keeps its contents.
    pub fn buffer(&self) {
        let mut reg = self.lock();
        if reg.buffer.is_none() {
            reg.buffer = Some(Vec::new());
        }
    }

    /// Deliver all buffered events in order and resume live dispatch.
    ///
    /// Updates emitted by handlers during the flush buffer again and are
    /// drained in a follow-up pass, preserving order.
    pub fn flush(&self) {
        loop {
            let batch = {
                let mut reg = self.lock();
                match reg.buffer.take() {
                    Some(batch) if !batch.is_empty() => {
                        // Re-arm so handler-emitted updates queue behind
                        // this batch rather than interleaving with it.
                        reg.buffer = Some(Vec::new());
                        batch
                    }
                    _ => return,
                }
            };
            for event in batch {
                self.deliver(&event);
            }
        }
    }

    /// Dispatch an event, or queue it while the buffer is armed.
    ///
    /// Buffered connection updates coalesce only when consecutive, so
    /// ordering relative to other event kinds is preserved.
    pub fn emit(&self, event: Event) {
        {
            let mut reg = self.lock();
            if let Some(buffer) = reg.buffer.as_mut() {
                match event {
                    Event::ConnectionUpdate(update) => {
                        if let Some(Event::ConnectionUpdate(last)) = buffer.last_mut() {
                            last.merge(&update);
                        } else {
                            buffer.push(Event::ConnectionUpdate(update));
                        }
                    }
                    other => buffer.push(other),
                }
                return;
            }
        }
        self.deliver(&event);
    }

    fn deliver(&self, event: &Event) {
        // Snapshot outside the lock so handlers may register or remove
        // handlers re-entrantly; ones added mid-dispatch see later events.
        let snapshot: Vec<(u64, Handler)> = self.lock().handlers.clone();
        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(handler = id, "event handler panicked; continuing dispatch");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn update(state: SessionState) -> Event {
        Event::ConnectionUpdate(ConnectionUpdate {
            state: Some(state),
            ..Default::default()
        })
    }

    fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<Event>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add_handler(move |event| sink.lock().unwrap().push(event.clone()));
        (bus, seen)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.add_handler(move |_| order.lock().unwrap().push(label));
        }

        bus.emit(update(SessionState::Ready));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_handler_stops_delivery() {
        let (bus, seen) = recording_bus();
        let noisy = {
            let seen = Arc::clone(&seen);
            bus.add_handler(move |event| seen.lock().unwrap().push(event.clone()))
        };

        assert!(bus.remove_handler(noisy));
        assert!(!bus.remove_handler(noisy));
        bus.emit(update(SessionState::Ready));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_buffer_holds_connection_updates() {
        let (bus, seen) = recording_bus();
        bus.buffer();

        bus.emit(update(SessionState::Connecting));
        bus.emit(update(SessionState::Authenticating));
        assert!(seen.lock().unwrap().is_empty());

        bus.flush();
        let events = seen.lock().unwrap();
        // Consecutive buffered updates coalesce into one.
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ConnectionUpdate(u) => assert_eq!(u.state, Some(SessionState::Authenticating)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_coalesce_keeps_fields_from_both_updates() {
        let bus = EventBus::new();
        bus.buffer();
        bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            state: Some(SessionState::CatchingUp),
            ..Default::default()
        }));
        bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            received_pending_notifications: Some(true),
            ..Default::default()
        }));

        let merged = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&merged);
        bus.add_handler(move |event| {
            if let Event::ConnectionUpdate(u) = event {
                *sink.lock().unwrap() = Some(u.clone());
            }
        });
        bus.flush();

        let merged = merged.lock().unwrap().clone().unwrap();
        assert_eq!(merged.state, Some(SessionState::CatchingUp));
        assert_eq!(merged.received_pending_notifications, Some(true));
    }

    #[test]
    fn test_buffer_holds_all_event_kinds_in_order() {
        let (bus, seen) = recording_bus();
        bus.buffer();

        bus.emit(update(SessionState::Authenticating));
        bus.emit(Event::CredsUpdate(CredsUpdate {
            registered: Some(true),
            ..Default::default()
        }));
        bus.emit(update(SessionState::CatchingUp));
        // Nothing reaches handlers until the flush.
        assert!(seen.lock().unwrap().is_empty());

        bus.flush();
        let events = seen.lock().unwrap();
        // The interleaved creds update keeps the two connection updates
        // from coalescing with each other.
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            Event::ConnectionUpdate(u) if u.state == Some(SessionState::Authenticating)
        ));
        assert!(matches!(&events[1], Event::CredsUpdate(_)));
        assert!(matches!(
            &events[2],
            Event::ConnectionUpdate(u) if u.state == Some(SessionState::CatchingUp)
        ));
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        bus.add_handler(|_| panic!("boom"));
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        bus.add_handler(move |_| *flag.lock().unwrap() = true);

        bus.emit(update(SessionState::Ready));
        assert!(*reached.lock().unwrap());
    }
}
