//! The session client.
//!
//! One [`Client`] owns one connection attempt end to end: transport
//! connect, handshake, authentication, catch-up, steady state, teardown.
//! The handle is not reusable; reconnection means a fresh client.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting -> Authenticating -> CatchingUp -> Ready
//!        \______________\______________\_________\-> Closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::core::{CodecError, DisconnectReason, SessionError, Transport, TransportEvent};
use crate::transport::{CodecState, Endpoint, FrameCodec};

use super::config::SessionConfig;
use super::correlator::RequestCorrelator;
use super::creds::{Credentials, CredsUpdate};
use super::events::{ConnectionUpdate, Event, EventBus, SessionState};
use super::keystore::KeyStore;
use super::node::{ATTR_ID, Node};
use super::recovery::{FailureClass, RecoveryPolicy, classify_failure};

/// Client handle for one secured session. Cheap to clone.
pub struct Client<T: Transport, S: KeyStore> {
    inner: Arc<Inner<T, S>>,
}

impl<T: Transport, S: KeyStore> Clone for Client<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport, S: KeyStore> {
    config: SessionConfig,
    endpoint: Endpoint,
    transport: T,
    store: S,
    codec: std::sync::Mutex<FrameCodec>,
    creds: std::sync::Mutex<Credentials>,
    correlator: RequestCorrelator,
    events: EventBus,
    recovery: RecoveryPolicy,
    state: std::sync::Mutex<SessionState>,
    // Latched shutdown signal; watch keeps it visible to tasks that
    // subscribe after the send.
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl<T: Transport, S: KeyStore> Client<T, S> {
    /// Create a client.
    ///
    /// Endpoint and access-mode validation happens here, before any
    /// connect attempt; a bad configuration never reaches the network.
    pub fn new(
        config: SessionConfig,
        transport: T,
        store: S,
        creds: Credentials,
    ) -> Result<Self, SessionError> {
        let endpoint = Endpoint::parse(
            &config.endpoint_url,
            config.mode,
            creds.routing_info.as_deref(),
        )?;
        let codec = FrameCodec::initiator(&creds.identity)?;
        let recovery = RecoveryPolicy::new(config.backoff_base);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                transport,
                store,
                codec: std::sync::Mutex::new(codec),
                creds: std::sync::Mutex::new(creds),
                correlator: RequestCorrelator::new(),
                events: EventBus::new(),
                recovery,
                state: std::sync::Mutex::new(SessionState::Connecting),
                shutdown: watch::channel(false).0,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The resolved endpoint URL, routing parameter included.
    pub fn endpoint(&self) -> &str {
        self.inner.endpoint.as_str()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.lock_state()
    }

    /// Register an event handler; see [`EventBus::add_handler`].
    pub fn add_event_handler<F>(&self, handler: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.add_handler(handler)
    }

    /// Remove a previously registered event handler.
    pub fn remove_event_handler(&self, id: u64) -> bool {
        self.inner.events.remove_handler(id)
    }

    /// Connect, handshake, and send the authentication payload.
    ///
    /// Returns once authentication is in flight; the `success` or
    /// `failure` outcome arrives through events. Events are buffered
    /// from here until the session reaches ready.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.inner.events.buffer();
        self.inner.set_state(SessionState::Connecting);

        let transport_events = self.inner.transport.connect().await?;
        let reply_rx = self.inner.correlator.register_next()?;
        self.inner.spawn_read_loop(transport_events);

        if let Err(err) = self.inner.handshake(reply_rx).await {
            // A half-built channel must not linger.
            let reason = match &err {
                SessionError::Codec(_) => DisconnectReason::CryptoFailure,
                _ => DisconnectReason::ConnectionLost,
            };
            self.inner.end(reason).await;
            return Err(err);
        }

        self.inner.set_state(SessionState::Authenticating);
        let auth = self.inner.auth_node();
        if let Err(err) = self.inner.send_node(auth).await {
            self.inner.end(DisconnectReason::ConnectionLost).await;
            return Err(err);
        }
        Ok(())
    }

    /// Send a node without waiting for a reply.
    pub async fn send_node(&self, node: Node) -> Result<(), SessionError> {
        self.inner.send_node(node).await
    }

    /// Send a tagged request and wait for the correlated reply, bounded
    /// by the configured query timeout.
    pub async fn query(&self, node: Node) -> Result<Node, SessionError> {
        self.inner
            .query_with_timeout(node, self.inner.config.query_timeout)
            .await
    }

    /// [`query`](Client::query) with an explicit timeout.
    pub async fn query_with_timeout(
        &self,
        node: Node,
        timeout: Duration,
    ) -> Result<Node, SessionError> {
        self.inner.query_with_timeout(node, timeout).await
    }

    /// Wait for the next inbound frame, whatever it is, bounded by the
    /// configured query timeout.
    pub async fn await_next_message(&self) -> Result<Bytes, SessionError> {
        self.await_next_message_with_timeout(self.inner.config.query_timeout)
            .await
    }

    /// [`await_next_message`](Client::await_next_message) with an explicit
    /// timeout.
    pub async fn await_next_message_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Bytes, SessionError> {
        let rx = self.inner.correlator.register_next()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Invalidate the session on the server, then tear down locally.
    ///
    /// The server round trip is best-effort; teardown happens regardless.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let request = Node::new("logout");
        if let Err(err) = self
            .inner
            .query_with_timeout(request, Duration::from_secs(5))
            .await
        {
            debug!(error = %err, "logout request failed; tearing down anyway");
        }
        self.inner.end(DisconnectReason::LoggedOut).await;
        Ok(())
    }

    /// Tear down the connection locally with the given reason.
    pub async fn end(&self, reason: DisconnectReason) {
        self.inner.end(reason).await;
    }
}

impl<T: Transport, S: KeyStore> Inner<T, S> {
    async fn handshake(&self, reply_rx: oneshot::Receiver<Bytes>) -> Result<(), SessionError> {
        let intro = self.lock_codec().start_handshake()?;
        self.transport.send(intro).await?;

        let reply = tokio::time::timeout(self.config.connect_timeout, reply_rx)
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|_| SessionError::ConnectionClosed)?;

        let last = self.lock_codec().process_handshake_response(&reply)?;
        self.transport.send(last).await?;
        info!("secure channel established");
        Ok(())
    }

    async fn send_node(&self, node: Node) -> Result<(), SessionError> {
        // The rate-limit gate is enforced: every send passes through it.
        self.recovery.wait_until_ready().await;

        if self.closed.load(Ordering::SeqCst) || !self.transport.is_open() {
            return Err(SessionError::ConnectionClosed);
        }
        let payload = node.encode()?;
        let frame = self
            .lock_codec()
            .encode_frame(&payload)
            .map_err(|err| match err {
                CodecError::Closed => SessionError::ConnectionClosed,
                other => SessionError::Codec(other),
            })?;
        tokio::time::timeout(self.config.connect_timeout, self.transport.send(frame))
            .await
            .map_err(|_| SessionError::SendTimeout)?
            .map_err(|_| SessionError::ConnectionClosed)?;
        Ok(())
    }

    async fn query_with_timeout(
        &self,
        node: Node,
        timeout: Duration,
    ) -> Result<Node, SessionError> {
        let tag = self.correlator.generate_tag();
        let rx = self.correlator.register_tag(&tag)?;
        if let Err(err) = self.send_node(node.with_attr(ATTR_ID, tag.clone())).await {
            self.correlator.unregister(&tag);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => {
                // The waiter must not outlive its request.
                self.correlator.unregister(&tag);
                Err(SessionError::Timeout)
            }
        }
    }

    fn auth_node(&self) -> Node {
        let creds = self.lock_creds();
        let mut node = Node::new("auth")
            .with_attr("registration-id", creds.registration_id.to_string())
            .with_attr("signed-prekey-id", creds.signed_prekey_id.to_string())
            .with_content(creds.identity.public_key().to_vec());
        if let Some(user) = creds.current_user() {
            node = node.with_attr("user", user.to_string());
        }
        node
    }

    fn spawn_read_loop(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    event = events.recv() => match event {
                        Some(TransportEvent::Data(chunk)) => {
                            if !inner.handle_chunk(&chunk).await {
                                break;
                            }
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            debug!(?reason, "transport closed");
                            inner.end(DisconnectReason::ConnectionLost).await;
                            break;
                        }
                        None => {
                            inner.end(DisconnectReason::ConnectionLost).await;
                            break;
                        }
                    },
                }
            }
            debug!("read loop exited");
        });
    }

    /// Feed one transport chunk through the codec and route the frames.
    /// Returns `false` when the loop must stop.
    async fn handle_chunk(self: &Arc<Self>, chunk: &[u8]) -> bool {
        // Bind before matching so the codec guard drops ahead of any await.
        let fed = self.lock_codec().feed(chunk);
        let frames = match fed {
            Ok(frames) => frames,
            Err(err) => {
                // Frame auth failure is never silent: the channel is
                // unusable and must come down as a crypto failure.
                warn!(error = %err, "codec error on inbound data");
                self.end(DisconnectReason::CryptoFailure).await;
                return false;
            }
        };
        for frame in frames {
            self.route_frame(frame).await;
        }
        true
    }

    async fn route_frame(self: &Arc<Self>, frame: Bytes) {
        // Before the channel is established every frame is handshake
        // material for whoever is waiting on it.
        if self.lock_codec().state() != CodecState::Established {
            if !self.correlator.resolve_next(frame) {
                debug!("dropping pre-establishment frame with no waiter");
            }
            return;
        }

        let node = match Node::decode(&frame) {
            Ok(node) => node,
            Err(_) => {
                // Handshake messages and anything undecodable go to the
                // oldest raw waiter.
                if !self.correlator.resolve_next(frame) {
                    debug!("dropping unparseable frame with no waiter");
                }
                return;
            }
        };

        if self.correlator.resolve_tagged(&node) {
            return;
        }

        match node.tag.as_str() {
            "success" => self.handle_success(&node),
            "failure" => self.handle_failure(&node).await,
            "stream:error" => self.handle_stream_error(&node).await,
            "pair" => self.handle_pair(&node),
            "offline" => self.handle_offline(&node),
            "ping" => {
                if let Some(id) = node.id() {
                    let pong = Node::new("pong").with_attr(ATTR_ID, id.to_string());
                    if let Err(err) = self.send_node(pong).await {
                        debug!(error = %err, "failed to answer ping");
                    }
                }
            }
            other => {
                if !self.correlator.resolve_next(frame) {
                    debug!(tag = other, "unhandled node");
                }
            }
        }
    }

    fn handle_success(self: &Arc<Self>, node: &Node) {
        info!("authenticated");
        let (was_registered, update) = {
            let mut creds = self.lock_creds();
            if creds.registered {
                (true, None)
            } else {
                let mut update = CredsUpdate {
                    registered: Some(true),
                    ..Default::default()
                };
                if let Some(user) = node.attr("user") {
                    update.user = Some(user.to_string());
                }
                creds.merge(&update);
                (false, Some(update))
            }
        };
        if let Some(update) = update {
            self.events.emit(Event::CredsUpdate(update));
        }
        if was_registered {
            // An existing login has notifications queued server-side to
            // drain before the session counts as ready.
            self.set_state(SessionState::CatchingUp);
        } else {
            // A fresh registration has no backlog to catch up on.
            self.enter_ready(None);
        }
    }

    async fn handle_failure(self: &Arc<Self>, node: &Node) {
        let condition = node.attr("reason").unwrap_or_default();
        match classify_failure(condition) {
            FailureClass::RateLimited => self.recovery.record_rate_limit(),
            FailureClass::MacMismatch => {
                warn!(condition, "mac failure reported; republishing prekeys");
                self.spawn_prekey_republish();
            }
            FailureClass::Other => {
                if *self.lock_state() == SessionState::Authenticating {
                    warn!(condition, "authentication rejected");
                    self.end(DisconnectReason::AuthFailure).await;
                } else {
                    debug!(condition, "server failure");
                }
            }
        }
    }

    async fn handle_stream_error(self: &Arc<Self>, node: &Node) {
        let code = node.attr("code").unwrap_or_default();
        warn!(code, "stream error");
        // 4xx means the server evicted this device; anything else is a
        // transient connection loss.
        let reason = if code.starts_with('4') {
            DisconnectReason::LoggedOut
        } else {
            DisconnectReason::ConnectionLost
        };
        self.end(reason).await;
    }

    fn handle_pair(&self, node: &Node) {
        let Some(pairing_ref) = node.attr("ref") else {
            debug!("pair node without ref");
            return;
        };
        // The pairing payload must reach the application now, not after
        // catch-up: drain what is buffered, deliver, and re-arm.
        self.events.flush();
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            pairing_ref: Some(pairing_ref.to_string()),
            ..Default::default()
        }));
        self.events.buffer();
    }

    fn handle_offline(self: &Arc<Self>, node: &Node) {
        let count = node.attr("count").unwrap_or("0");
        info!(count, "offline notifications drained");
        self.enter_ready(Some(true));
    }

    /// Transition to ready: drain the event buffer, announce the state,
    /// and start the keep-alive timer. No-op once ready or closed.
    fn enter_ready(self: &Arc<Self>, received_pending: Option<bool>) {
        {
            let mut state = self.lock_state();
            if matches!(*state, SessionState::Ready | SessionState::Closed) {
                return;
            }
            *state = SessionState::Ready;
        }
        self.events.flush();
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            state: Some(SessionState::Ready),
            received_pending_notifications: received_pending,
            ..Default::default()
        }));
        self.spawn_keepalive();
    }

    fn spawn_prekey_republish(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Some(batch) = inner.recovery.republish_prekeys(&inner.store).await else {
                return;
            };
            let mut content = Vec::with_capacity(batch.len() * 36);
            for prekey in &batch {
                content.extend_from_slice(&prekey.id.to_be_bytes());
                content.extend_from_slice(&prekey.public);
            }
            let upload = Node::new("prekeys")
                .with_attr("count", batch.len().to_string())
                .with_content(content);
            if let Err(err) = inner.send_node(upload).await {
                warn!(error = %err, "prekey upload failed");
            }
        });
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let interval = inner.config.keepalive_interval;
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match inner.query_with_timeout(Node::new("ping"), interval).await {
                    Ok(_) => {
                        inner.recovery.record_success();
                    }
                    Err(SessionError::Timeout) => {
                        // A missed keep-alive means the link is dead even
                        // if the transport has not noticed yet.
                        warn!("keep-alive timed out");
                        inner.end(DisconnectReason::ConnectionLost).await;
                        break;
                    }
                    Err(err) => {
                        debug!(error = %err, "keep-alive stopped");
                        break;
                    }
                }
            }
        });
    }

    async fn end(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(%reason, "session ending");

        self.shutdown.send_replace(true);
        self.correlator.reject_all();
        self.lock_codec().close();
        self.transport.close().await;
        *self.lock_state() = SessionState::Closed;

        // Deliver anything still buffered before the terminal update.
        self.events.flush();
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            state: Some(SessionState::Closed),
            last_disconnect: Some(reason),
            ..Default::default()
        }));
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            state: Some(state),
            ..Default::default()
        }));
    }

    fn lock_codec(&self) -> std::sync::MutexGuard<'_, FrameCodec> {
        self.codec.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_creds(&self) -> std::sync::MutexGuard<'_, Credentials> {
        self.creds.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeypair;
    use crate::session::keystore::MemoryKeyStore;
    use crate::transport::MemoryTransport;
    use std::sync::Mutex;

    fn test_config() -> SessionConfig {
        SessionConfig::builder("wss://gateway.example.net/ws")
            .connect_timeout(Duration::from_secs(5))
            .query_timeout(Duration::from_secs(5))
            // Long enough that keep-alives never fire inside a test.
            .keepalive_interval(Duration::from_secs(3600))
            .build()
    }

    /// Run the server side of the channel: handshake, then hand each
    /// decoded node to `on_node`, sending back any nodes it returns.
    fn spawn_server<F>(transport: MemoryTransport, on_node: F)
    where
        F: Fn(&Node) -> Vec<Node> + Send + 'static,
    {
        tokio::spawn(async move {
            let identity = IdentityKeypair::generate().unwrap();
            let mut codec = FrameCodec::responder(&identity).unwrap();
            let mut events = transport.connect().await.unwrap();
            let mut replied = false;

            while let Some(event) = events.recv().await {
                let TransportEvent::Data(chunk) = event else { break };
                let frames = match codec.feed(&chunk) {
                    Ok(frames) => frames,
                    Err(_) => break,
                };
                for frame in frames {
                    match codec.state() {
                        CodecState::Handshaking if !replied => {
                            let reply = codec.process_handshake_init(&frame).unwrap();
                            transport.send(reply).await.unwrap();
                            replied = true;
                        }
                        CodecState::Handshaking => {
                            codec.process_handshake_finish(&frame).unwrap();
                        }
                        _ => {
                            let node = Node::decode(&frame).unwrap();
                            for reply in on_node(&node) {
                                let payload = reply.encode().unwrap();
                                let out = codec.encode_frame(&payload).unwrap();
                                transport.send(out).await.unwrap();
                            }
                        }
                    }
                }
            }
        });
    }

    fn new_client(
        transport: MemoryTransport,
    ) -> Client<MemoryTransport, MemoryKeyStore> {
        Client::new(
            test_config(),
            transport,
            MemoryKeyStore::new(),
            Credentials::generate().unwrap(),
        )
        .unwrap()
    }

    /// Like [`new_client`] but with credentials carrying a prior login,
    /// so authentication leads into catch-up.
    fn registered_client(
        transport: MemoryTransport,
    ) -> Client<MemoryTransport, MemoryKeyStore> {
        let mut creds = Credentials::generate().unwrap();
        creds.registered = true;
        Client::new(test_config(), transport, MemoryKeyStore::new(), creds).unwrap()
    }

    fn recorded_updates(client: &Client<MemoryTransport, MemoryKeyStore>) -> Arc<Mutex<Vec<ConnectionUpdate>>> {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        client.add_event_handler(move |event| {
            if let Event::ConnectionUpdate(update) = event {
                sink.lock().unwrap().push(update.clone());
            }
        });
        updates
    }

    #[test]
    fn test_invalid_scheme_rejected_before_connect() {
        let (transport, _peer) = MemoryTransport::pair();
        let config = SessionConfig::builder("ws://gateway.example.net/ws").build();
        let err = Client::new(
            config,
            transport,
            MemoryKeyStore::new(),
            Credentials::generate().unwrap(),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_and_query_roundtrip() {
        let (client_end, server_end) = MemoryTransport::pair();
        // Fragment deliveries to exercise reassembly under the client.
        client_end.set_chunk_size(3);
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            "echo" => vec![
                Node::new("result")
                    .with_attr(ATTR_ID, node.id().unwrap().to_string())
                    .with_content(b"pong".to_vec()),
            ],
            _ => vec![],
        });

        let client = new_client(client_end);
        client.connect().await.unwrap();

        let reply = client.query(Node::new("echo")).await.unwrap();
        assert_eq!(reply.tag, "result");
        assert_eq!(reply.content.as_deref(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn test_query_timeout_removes_waiter() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![], // swallow everything else
        });

        let client = new_client(client_end);
        client.connect().await.unwrap();

        let err = client
            .query_with_timeout(Node::new("echo"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(client.inner.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_end_rejects_concurrent_query() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        client.connect().await.unwrap();

        let waiter = client.clone();
        let pending = tokio::spawn(async move { waiter.query(Node::new("slow")).await });
        // Let the query register before tearing down.
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.end(DisconnectReason::Ended).await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_lifecycle_updates_buffer_until_offline() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![
                Node::new("success"),
                Node::new("offline").with_attr("count", "12"),
            ],
            _ => vec![],
        });

        let client = registered_client(client_end);
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        // Nothing delivered mid-connect; the buffer drains at ready.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client.state() == SessionState::Ready {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never reached ready");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let updates = updates.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.state, Some(SessionState::Ready));
        assert_eq!(last.received_pending_notifications, Some(true));
        // Pre-ready transitions coalesced into a single buffered update.
        assert!(updates.len() <= 2, "updates: {updates:?}");
    }

    #[tokio::test]
    async fn test_registration_recorded_on_success() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success").with_attr("user", "alice@example.net")],
            _ => vec![],
        });

        let client = new_client(client_end);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        client.add_event_handler(move |event| {
            if let Event::CredsUpdate(update) = event {
                *sink.lock().unwrap() = Some(update.clone());
            }
        });
        client.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "no creds update");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let update = seen.lock().unwrap().clone().unwrap();
        assert_eq!(update.registered, Some(true));
        assert_eq!(update.user.as_deref(), Some("alice@example.net"));
        assert_eq!(
            client.inner.lock_creds().current_user(),
            Some("alice@example.net")
        );
    }

    #[tokio::test]
    async fn test_server_close_surfaces_connection_lost() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        // Kill the transport out from under the client.
        client.inner.transport.close().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.state() != SessionState::Closed {
            assert!(tokio::time::Instant::now() < deadline, "never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let updates = updates.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.last_disconnect, Some(DisconnectReason::ConnectionLost));
    }

    #[tokio::test]
    async fn test_keepalive_miss_tears_down() {
        let (client_end, server_end) = MemoryTransport::pair();
        // Server authenticates but never answers pings.
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let config = SessionConfig::builder("wss://gateway.example.net/ws")
            .connect_timeout(Duration::from_secs(5))
            .query_timeout(Duration::from_secs(5))
            .keepalive_interval(Duration::from_millis(50))
            .build();
        let client = Client::new(
            config,
            client_end,
            MemoryKeyStore::new(),
            Credentials::generate().unwrap(),
        )
        .unwrap();
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.state() != SessionState::Closed {
            assert!(tokio::time::Instant::now() < deadline, "keep-alive never fired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let updates = updates.lock().unwrap();
        assert_eq!(
            updates.last().unwrap().last_disconnect,
            Some(DisconnectReason::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout_tears_down() {
        let (client_end, server_end) = MemoryTransport::pair();
        // Peer connects but never answers the handshake.
        tokio::spawn(async move {
            let mut events = server_end.connect().await.unwrap();
            while events.recv().await.is_some() {}
        });

        let config = SessionConfig::builder("wss://gateway.example.net/ws")
            .connect_timeout(Duration::from_millis(50))
            .build();
        let client = Client::new(
            config,
            client_end,
            MemoryKeyStore::new(),
            Credentials::generate().unwrap(),
        )
        .unwrap();
        let updates = recorded_updates(&client);

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(client.state(), SessionState::Closed);
        assert!(!client.inner.transport.is_open());
        let updates = updates.lock().unwrap();
        assert_eq!(
            updates.last().unwrap().last_disconnect,
            Some(DisconnectReason::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_send_after_end_is_connection_closed() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        client.connect().await.unwrap();
        client.end(DisconnectReason::Ended).await;

        let err = client.send_node(Node::new("echo")).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_await_next_message_times_out() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        client.connect().await.unwrap();

        let err = client
            .await_next_message_with_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }

    #[tokio::test]
    async fn test_fresh_registration_skips_catch_up() {
        let (client_end, server_end) = MemoryTransport::pair();
        // No offline marker: a fresh registration has nothing to drain.
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.state() != SessionState::Ready {
            assert!(tokio::time::Instant::now() < deadline, "never reached ready");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let updates = updates.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.state, Some(SessionState::Ready));
        assert_eq!(last.received_pending_notifications, None);
    }

    #[tokio::test]
    async fn test_corrupted_frame_closes_as_crypto_failure() {
        let (client_end, server_end) = MemoryTransport::pair();
        // Server completes the handshake, then answers the auth payload
        // with a framed blob that cannot authenticate.
        tokio::spawn(async move {
            let identity = IdentityKeypair::generate().unwrap();
            let mut codec = FrameCodec::responder(&identity).unwrap();
            let mut events = server_end.connect().await.unwrap();
            let mut replied = false;

            while let Some(event) = events.recv().await {
                let TransportEvent::Data(chunk) = event else { break };
                let Ok(frames) = codec.feed(&chunk) else { break };
                for frame in frames {
                    if !replied {
                        let reply = codec.process_handshake_init(&frame).unwrap();
                        server_end.send(reply).await.unwrap();
                        replied = true;
                    } else if codec.state() == CodecState::Handshaking {
                        codec.process_handshake_finish(&frame).unwrap();
                    } else {
                        let mut junk = vec![0u8, 0, 20];
                        junk.extend_from_slice(&[0xAA; 20]);
                        server_end.send(junk.into()).await.unwrap();
                    }
                }
            }
        });

        let client = new_client(client_end);
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.state() != SessionState::Closed {
            assert!(tokio::time::Instant::now() < deadline, "never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let updates = updates.lock().unwrap();
        assert_eq!(
            updates.last().unwrap().last_disconnect,
            Some(DisconnectReason::CryptoFailure)
        );
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (client_end, server_end) = MemoryTransport::pair();
        spawn_server(server_end, |node| match node.tag.as_str() {
            "auth" => vec![Node::new("success")],
            _ => vec![],
        });

        let client = new_client(client_end);
        let updates = recorded_updates(&client);
        client.connect().await.unwrap();

        client.end(DisconnectReason::Ended).await;
        client.end(DisconnectReason::ConnectionLost).await;

        let updates = updates.lock().unwrap();
        let terminal: Vec<_> = updates
            .iter()
            .filter(|u| u.state == Some(SessionState::Closed))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].last_disconnect, Some(DisconnectReason::Ended));
    }
}
