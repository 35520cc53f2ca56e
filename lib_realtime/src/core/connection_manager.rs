//! # Connection Manager
//!
//! Owns exactly one logical WebSocket connection and multiplexes inbound
//! messages to topic subscribers.
//!
//! ## Ownership model
//!
//! The socket itself lives inside a session actor (see `session.rs`) spawned
//! on `connect()`. The public handle never touches the socket: outbound frames
//! and manual reconnects are commands on an unbounded channel, and teardown is
//! a `CancellationToken`. The small amount of shared state (reference count,
//! current session, diagnostics) sits behind one mutex; the status is published
//! through a `tokio::sync::watch` channel so it can be read without locking.
//!
//! Every session carries a generation number. A session only updates shared
//! state while it is still the current one, so a slow task that outlives a
//! `force_disconnect()` cannot flip the status back to `connected`.
//!
//! ## Lifecycle
//!
//! ```text
//! disconnected/error --connect()--> connecting --open--> connected
//! connected --clean close--> disconnected
//! connected --abnormal close--> reconnecting --open--> connected
//! any --transport error--> error
//! any --force_disconnect()--> disconnected
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::ConnectionConfig;
use crate::core::backoff::Backoff;
use crate::core::registry::{invoke_isolated, lock, MessageHandler, ObserverList, Subscription, TopicRegistry};
use crate::core::session::{self, SessionCommand, SessionParams};
use crate::error::{ProtocolError, RealtimeError, Result};
use crate::models::message::{now_rfc3339, Envelope, Message, TOPIC_PING};
use crate::models::{ConnectionStats, ConnectionStatus, DecoderRegistry};

/// Callback type for status observers.
pub type StatusHandler = dyn Fn(ConnectionStatus) + Send + Sync;

/// Handle to the session actor that currently owns the socket.
struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ConnState {
    ref_count: usize,
    url: Option<String>,
    session: Option<SessionHandle>,
    reconnect_attempt: u32,
    next_reconnect_delay: Option<Duration>,
    connected_since: Option<String>,
    last_message_at: Option<String>,
    last_heartbeat_at: Option<String>,
}

impl ConnState {
    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    protocol_errors: AtomicU64,
    handler_faults: AtomicU64,
}

/// State shared between the public handle and the session actor.
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    client_id: String,
    decoders: DecoderRegistry,
    topics: TopicRegistry,
    status_observers: ObserverList<StatusHandler>,
    status_tx: watch::Sender<ConnectionStatus>,
    state: Mutex<ConnState>,
    counters: Counters,
    next_generation: AtomicU64,
}

impl Shared {
    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Must be called with the state lock held so status and session agree.
    fn set_status_locked(&self, _state: &ConnState, status: ConnectionStatus) -> bool {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    fn notify_status(&self, status: ConnectionStatus) {
        log::debug!("Connection status changed to {}", status);
        for snapshot in self.status_observers.snapshot() {
            if let Some(handler) = snapshot.live() {
                if !invoke_isolated("status observer", || handler(status)) {
                    self.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Applies a status change on behalf of session `generation`.
    ///
    /// Returns `false` if that session is no longer current.
    pub(crate) fn transition(&self, generation: u64, status: ConnectionStatus) -> bool {
        let changed = {
            let state = lock(&self.state);
            if !state.is_current(generation) {
                return false;
            }
            self.set_status_locked(&state, status)
        };
        if changed {
            self.notify_status(status);
        }
        true
    }

    /// Records a successful open and moves to `connected`.
    pub(crate) fn mark_open(&self, generation: u64) -> bool {
        let changed = {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return false;
            }
            state.reconnect_attempt = 0;
            state.next_reconnect_delay = None;
            state.connected_since = Some(now_rfc3339());
            self.set_status_locked(&state, ConnectionStatus::Connected)
        };
        if changed {
            self.notify_status(ConnectionStatus::Connected);
        }
        true
    }

    /// Detaches session `generation` and leaves the manager in `status`.
    pub(crate) fn finish_session(&self, generation: u64, status: ConnectionStatus) {
        let changed = {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return;
            }
            state.session = None;
            state.connected_since = None;
            state.next_reconnect_delay = None;
            self.set_status_locked(&state, status)
        };
        if changed {
            self.notify_status(status);
        }
    }

    /// Ends session `generation` after its first attempt failed and releases
    /// the reference taken by the `connect()` that started it.
    pub(crate) fn fail_first_attempt(&self, generation: u64) {
        let changed = {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return;
            }
            state.ref_count = state.ref_count.saturating_sub(1);
            state.session = None;
            state.connected_since = None;
            state.next_reconnect_delay = None;
            self.set_status_locked(&state, ConnectionStatus::Error)
        };
        if changed {
            self.notify_status(ConnectionStatus::Error);
        }
    }

    pub(crate) fn record_backoff(&self, generation: u64, backoff: &Backoff) {
        let mut state = lock(&self.state);
        if state.is_current(generation) {
            state.reconnect_attempt = backoff.attempt();
            state.next_reconnect_delay = backoff.next_delay();
            state.connected_since = None;
        }
    }

    pub(crate) fn record_sent(&self) {
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self, error: &ProtocolError) {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("Dropping inbound frame: {}", error);
    }

    /// Parses one text frame and routes it to subscribers.
    ///
    /// Returns the number of handlers that were invoked.
    pub(crate) fn handle_text(&self, text: &str) -> std::result::Result<usize, ProtocolError> {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        lock(&self.state).last_message_at = Some(now_rfc3339());

        let message = match self.decoders.parse_frame(text) {
            Ok(message) => message,
            Err(e) => {
                self.record_protocol_error(&e);
                return Err(e);
            }
        };
        log::trace!("Dispatching '{}' message", message.topic);

        let (delivered, faults) = self.topics.dispatch(&message);
        if faults > 0 {
            self.counters
                .handler_faults
                .fetch_add(faults as u64, Ordering::Relaxed);
        }
        Ok(delivered)
    }

    /// Serialized keepalive frame, or `None` if serialization failed.
    pub(crate) fn heartbeat_frame(&self) -> Option<String> {
        let now = now_rfc3339();
        let envelope = Envelope::new(
            TOPIC_PING,
            json!({ "client_id": self.client_id, "last_heartbeat": now }),
        );
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                lock(&self.state).last_heartbeat_at = Some(now);
                Some(text)
            }
            Err(e) => {
                log::error!("Failed to serialize heartbeat: {}", e);
                None
            }
        }
    }
}

/// Shared, reference-counted WebSocket connection with topic routing.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.inner.client_id)
            .field("status", &self.status())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_decoders(config, DecoderRegistry::default())
    }

    /// Creates a manager with a custom topic decoder registry.
    pub fn with_decoders(config: ConnectionConfig, decoders: DecoderRegistry) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Shared {
                config,
                client_id: uuid::Uuid::new_v4().to_string(),
                decoders,
                topics: TopicRegistry::new(),
                status_observers: ObserverList::new(),
                status_tx,
                state: Mutex::new(ConnState::default()),
                counters: Counters::default(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Identifier sent in heartbeat payloads.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Takes a reference on the connection, opening it if needed.
    ///
    /// If a connection is already open or being established this returns
    /// immediately. Otherwise it resolves once the transport is open, or
    /// fails after `connection_timeout_ms`; on failure the reference taken
    /// by this call is released and the status becomes `error`. Later
    /// reconnection failures are reported only through status changes.
    pub async fn connect(&self, url: &str) -> Result<()> {
        validate_url(url)?;

        let (ready_rx, changed) = {
            let mut state = lock(&self.inner.state);
            state.ref_count += 1;
            if state.session.is_some() {
                if state.url.as_deref() != Some(url) {
                    log::warn!(
                        "connect({}) shares the existing connection to {}",
                        url,
                        state.url.as_deref().unwrap_or("?")
                    );
                }
                log::debug!("Connection already active, ref count is now {}", state.ref_count);
                return Ok(());
            }
            let (ready_tx, ready_rx) = oneshot::channel();
            let changed = self.spawn_session_locked(&mut state, url.to_string(), Some(ready_tx));
            (ready_rx, changed)
        };
        self.notify_connecting(changed);

        // The session releases this call's reference itself if the first
        // attempt fails, so dropping this future leaks nothing.
        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::ConnectionClosed),
        }
    }

    /// Spawns a new session actor. Caller holds the state lock and passes
    /// the returned flag to `notify_connecting` once it is released.
    fn spawn_session_locked(
        &self,
        state: &mut ConnState,
        url: String,
        ready: Option<oneshot::Sender<Result<()>>>,
    ) -> bool {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        state.url = Some(url.clone());
        state.session = Some(SessionHandle {
            generation,
            commands: commands_tx,
            cancel: cancel.clone(),
        });
        state.reconnect_attempt = 0;
        state.next_reconnect_delay = None;
        let changed = self.inner.set_status_locked(state, ConnectionStatus::Connecting);

        log::info!("Opening connection to {} (session {})", url, generation);
        tokio::spawn(session::run(
            Arc::clone(&self.inner),
            SessionParams {
                generation,
                url,
                commands: commands_rx,
                cancel,
                ready,
            },
        ));
        changed
    }

    /// Skipped if the session already moved past `connecting`.
    fn notify_connecting(&self, changed: bool) {
        if changed && self.status() == ConnectionStatus::Connecting {
            self.inner.notify_status(ConnectionStatus::Connecting);
        }
    }

    /// Releases one reference. The socket is closed when the count reaches zero.
    pub fn disconnect(&self) {
        let torn_down = {
            let mut state = lock(&self.inner.state);
            if state.ref_count == 0 {
                log::debug!("disconnect() called with no outstanding references");
                return;
            }
            state.ref_count -= 1;
            if state.ref_count > 0 {
                log::debug!("Connection still referenced ({} left)", state.ref_count);
                return;
            }
            self.teardown_locked(&mut state)
        };
        if torn_down {
            self.inner.notify_status(ConnectionStatus::Disconnected);
        }
    }

    /// Closes the connection regardless of outstanding references.
    pub fn force_disconnect(&self) {
        let torn_down = {
            let mut state = lock(&self.inner.state);
            state.ref_count = 0;
            self.teardown_locked(&mut state)
        };
        if torn_down {
            self.inner.notify_status(ConnectionStatus::Disconnected);
        }
    }

    /// Cancels the current session and moves to `disconnected`.
    /// Returns whether the status changed.
    fn teardown_locked(&self, state: &mut ConnState) -> bool {
        if let Some(session) = state.session.take() {
            log::info!(
                "Closing connection to {} (session {})",
                state.url.as_deref().unwrap_or("?"),
                session.generation
            );
            session.cancel.cancel();
        }
        state.reconnect_attempt = 0;
        state.next_reconnect_delay = None;
        state.connected_since = None;
        self.inner.set_status_locked(state, ConnectionStatus::Disconnected)
    }

    /// Queues a message for sending.
    ///
    /// Returns `false` (and sends nothing) unless the status is `connected`.
    pub fn send(&self, message: &Envelope) -> bool {
        if !self.is_connected() {
            log::debug!("Not connected, dropping outbound '{}' message", message.topic);
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to serialize outbound '{}' message: {}", message.topic, e);
                return false;
            }
        };
        let state = lock(&self.inner.state);
        match &state.session {
            Some(session) => session.commands.send(SessionCommand::Send(text)).is_ok(),
            None => false,
        }
    }

    /// Builds an envelope for `topic` and sends it. See [`send`](Self::send).
    pub fn send_json<T: Serialize>(&self, topic: &str, data: &T) -> bool {
        match serde_json::to_value(data) {
            Ok(value) => self.send(&Envelope::new(topic, value)),
            Err(e) => {
                log::warn!("Failed to serialize outbound '{}' payload: {}", topic, e);
                false
            }
        }
    }

    /// Registers a handler for `topic`, or for every message with `"*"`.
    ///
    /// For one message, exact-topic handlers run before wildcard handlers. A
    /// panicking handler is logged and does not affect the others.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: Arc<MessageHandler> = Arc::new(handler);
        self.inner.topics.subscribe(topic, handler)
    }

    /// Registers a status observer and calls it once with the current status.
    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let handler: Arc<StatusHandler> = Arc::new(handler);
        let subscription = self.inner.status_observers.add(Arc::clone(&handler));
        let current = self.status();
        if !invoke_isolated("status observer", || handler(current)) {
            self.inner.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
        }
        subscription
    }

    /// A watch receiver for async consumers of the status.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.inner.state).ref_count
    }

    /// Drops the current socket and reconnects immediately.
    ///
    /// Ignored while the first attempt of a session is still opening.
    ///
    /// With no live session but outstanding references (for example after
    /// the retry budget ran out) a fresh session is started. Must be called
    /// from within a tokio runtime in that case.
    pub fn reconnect(&self) {
        let spawned = {
            let mut state = lock(&self.inner.state);
            if let Some(session) = &state.session {
                if self.status() == ConnectionStatus::Connecting {
                    log::debug!(
                        "Ignoring reconnect() while session {} is still opening",
                        session.generation
                    );
                    return;
                }
                log::info!("Manual reconnect requested (session {})", session.generation);
                let _ = session.commands.send(SessionCommand::Reconnect);
                return;
            }
            let Some(url) = state.url.clone() else {
                log::warn!("reconnect() called before any connect()");
                return;
            };
            if state.ref_count == 0 {
                log::warn!("reconnect() called with no outstanding references");
                return;
            }
            if tokio::runtime::Handle::try_current().is_err() {
                log::error!("reconnect() needs a tokio runtime to start a new session");
                return;
            }
            self.spawn_session_locked(&mut state, url, None)
        };
        self.notify_connecting(spawned);
    }

    /// Routes one raw text frame exactly as if it had arrived on the socket.
    ///
    /// Returns how many handlers were invoked. Malformed or topic-less frames
    /// are counted, logged and reported here, and reach no handler.
    pub fn dispatch_frame(&self, text: &str) -> std::result::Result<usize, ProtocolError> {
        self.inner.handle_text(text)
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        let counters = &self.inner.counters;
        let state = lock(&self.inner.state);
        ConnectionStats {
            status: self.inner.status(),
            url: state.url.clone(),
            ref_count: state.ref_count,
            client_id: self.inner.client_id.clone(),
            reconnect_attempt: state.reconnect_attempt,
            next_reconnect_delay_ms: state.next_reconnect_delay.map(|d| d.as_millis() as u64),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
            handler_faults: counters.handler_faults.load(Ordering::Relaxed),
            connected_since: state.connected_since.clone(),
            last_message_at: state.last_message_at.clone(),
            last_heartbeat_at: state.last_heartbeat_at.clone(),
            topic_count: self.inner.topics.topic_count(),
            handler_count: self.inner.topics.handler_count(),
        }
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| RealtimeError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(RealtimeError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_send_while_disconnected_returns_false() {
        let manager = ConnectionManager::default();
        assert!(!manager.send(&Envelope::new("anything", json!({}))));
        assert!(!manager.send_json("anything", &json!({ "a": 1 })));
        assert_eq!(manager.get_connection_stats().messages_sent, 0);
    }

    #[test]
    fn test_status_observer_gets_current_status_immediately() {
        let manager = ConnectionManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = manager.on_status_change(move |status| lock(&s).push(status));
        assert_eq!(*lock(&seen), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn test_malformed_frame_reaches_no_handler() {
        let manager = ConnectionManager::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let (h1, h2) = (Arc::clone(&hits), Arc::clone(&hits));
        let _exact = manager.subscribe("production_data", move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let _wild = manager.subscribe("*", move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            manager.dispatch_frame(r#"{"timestamp":"t","data":{"sourceId":"A"}}"#),
            Err(ProtocolError::MissingTopic)
        ));
        assert!(manager.dispatch_frame("not json at all").is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_connection_stats().protocol_errors, 2);

        let delivered = manager
            .dispatch_frame(r#"{"type":"production_data","timestamp":"t","data":{"sourceId":"A","timestamp":1}}"#)
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_fault_is_counted_not_propagated() {
        let manager = ConnectionManager::default();
        let _bad = manager.subscribe("x", |_| panic!("handler exploded"));
        assert_eq!(manager.dispatch_frame(r#"{"type":"x","timestamp":"t"}"#).unwrap(), 1);
        assert_eq!(manager.get_connection_stats().handler_faults, 1);
    }

    #[test]
    fn test_disconnect_without_connect_is_noop() {
        let manager = ConnectionManager::default();
        manager.disconnect();
        assert_eq!(manager.ref_count(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_without_taking_a_reference() {
        let manager = ConnectionManager::default();
        let err = manager.connect("http://example.com").await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidUrl { .. }));
        let err = manager.connect("not a url").await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidUrl { .. }));
        assert_eq!(manager.ref_count(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connection_fails_and_sets_error() {
        // Bind then drop a listener to get a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::default();
        let err = manager.connect(&format!("ws://{}", addr)).await.unwrap_err();
        assert!(matches!(err, RealtimeError::ConnectionEstablishment { .. }));
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.ref_count(), 0);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the WebSocket upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let manager = ConnectionManager::default();
        let err = manager.connect(&format!("ws://{}", addr)).await.unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::ConnectionTimeout { timeout_ms: 4000, .. }
        ));
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.ref_count(), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_force_disconnect_resets_ref_count() {
        let manager = ConnectionManager::default();
        manager.force_disconnect();
        assert_eq!(manager.ref_count(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
