//! The LiveQuery client: connection state machine and orchestration.
//!
//! [`LiveQueryClient`] owns the socket and wires the pieces together:
//!
//! - [`connect`](LiveQueryClient::connect) consults the circuit breaker,
//!   opens the (optionally TLS) socket, performs the WebSocket upgrade,
//!   starts the frame-reader task and sends the `connect` protocol message
//! - the reader task parses frames and dispatches JSON messages; change
//!   events are decoded and queued, never delivered from the reader
//! - the health monitor pings idle connections and tears down stale ones
//! - unexpected disconnects feed the circuit breaker and the
//!   exponential-backoff reconnect scheduler, which resubscribes every
//!   registered query after the next successful handshake
//!
//! Per client there are at most four background tasks: the frame reader,
//! the event-queue consumer, the health ticker and a single pending
//! reconnect timer (replaced, never stacked). Each component owns its own
//! lock and no lock is held across an await into another component.

use crate::backoff::ReconnectPolicy;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::error::{LiveQueryError, Result};
use crate::events::{Event, EventKind, JsonDecoder, ObjectDecoder, SharedDecoder};
use crate::frame::{self, Opcode};
use crate::handlers::{CloseReason, ConnectionHandlers};
use crate::health::{HealthInfo, HealthMonitor};
use crate::protocol::{ClientMessage, EventPayload, ServerMessage};
use crate::queue::{EventQueue, QueueStats};
use crate::subscription::{
    RequestIdSequence, Subscription, SubscriptionInfo, SubscriptionTransport,
};
use crate::timeouts::Timeouts;
use crate::transport::{self, Stream};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Connection phase of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a connect may be attempted.
    Disconnected,
    /// Socket being established and upgraded.
    Connecting,
    /// `connected` handshake completed; events are flowing.
    Connected,
    /// Shut down by the application. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct ConnState {
    phase: ConnectionState,
    client_id: Option<String>,
    /// Bumped on every connection change; stale reader tasks detect it.
    epoch: u64,
}

struct ReconnectControl {
    policy: ReconnectPolicy,
    pending: Option<JoinHandle<()>>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    decoder: SharedDecoder,
    request_ids: Arc<RequestIdSequence>,
    self_ref: Weak<ClientInner>,
    state: Mutex<ConnState>,
    writer: AsyncMutex<Option<WriteHalf<Stream>>>,
    subscriptions: Mutex<HashMap<u64, Arc<Subscription>>>,
    breaker: CircuitBreaker,
    queue: Arc<EventQueue>,
    health: Mutex<Option<Arc<HealthMonitor>>>,
    handlers: Mutex<ConnectionHandlers>,
    reconnect: Mutex<ReconnectControl>,
    auto_reconnect: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client for a LiveQuery push-notification server.
///
/// Cheap to clone; clones share the same connection.
///
/// # Examples
///
/// ```rust,no_run
/// use livequery_client::{Credentials, LiveQueryClient};
/// use serde_json::json;
///
/// # async fn example() -> livequery_client::Result<()> {
/// let client = LiveQueryClient::builder()
///     .endpoint("wss://example.com/livequery")
///     .credentials(Credentials::new("my-app").with_client_key("my-key"))
///     .build()?;
///
/// let subscription = client.subscribe("GameScore", json!({"score": {"$gt": 100}})).await?;
/// subscription.on_create(|event| {
///     println!("new high score: {:?}", event.object());
/// });
///
/// client.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LiveQueryClient {
    inner: Arc<ClientInner>,
}

impl LiveQueryClient {
    /// Start building a client.
    pub fn builder() -> LiveQueryClientBuilder {
        LiveQueryClientBuilder::new()
    }

    /// Create a client from a complete configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::from_parts(
            config,
            ConnectionHandlers::default(),
            Arc::new(JsonDecoder),
            RequestIdSequence::shared(),
        )
    }

    fn from_parts(
        config: ClientConfig,
        handlers: ConnectionHandlers,
        decoder: SharedDecoder,
        request_ids: Arc<RequestIdSequence>,
    ) -> Result<Self> {
        // Fail on malformed endpoints at build time, not first connect.
        transport::parse_endpoint(&config.endpoint)?;

        let auto_reconnect = config.auto_reconnect;
        let inner = Arc::new_cyclic(|self_ref| ClientInner {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            queue: EventQueue::new(config.queue.clone()),
            reconnect: Mutex::new(ReconnectControl {
                policy: ReconnectPolicy::new(config.reconnect.clone()),
                pending: None,
            }),
            decoder,
            request_ids,
            self_ref: self_ref.clone(),
            state: Mutex::new(ConnState {
                phase: ConnectionState::Disconnected,
                client_id: None,
                epoch: 0,
            }),
            writer: AsyncMutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            health: Mutex::new(None),
            handlers: Mutex::new(handlers),
            auto_reconnect: AtomicBool::new(auto_reconnect),
            reader: Mutex::new(None),
            config,
        });
        Ok(Self { inner })
    }

    /// Attempt to connect.
    ///
    /// Returns `Ok(true)` when connected or already connecting, `Ok(false)`
    /// when the circuit breaker denied the attempt (an error notification
    /// is emitted and, with auto-reconnect on, a retry is scheduled), and
    /// `Err` when the attempt itself failed, in which case the failure has
    /// already been recorded on the breaker and a retry scheduled.
    pub async fn connect(&self) -> Result<bool> {
        self.inner.connect().await
    }

    /// Register a live query for `class_name` with the given filter.
    ///
    /// The filter is the compiled `where` clause produced by the query
    /// layer; this crate treats it as opaque JSON. When connected, the
    /// subscribe message is sent immediately; otherwise (with
    /// `auto_connect`) a connection attempt is triggered and the
    /// subscription is sent during the post-handshake resubscribe pass.
    pub async fn subscribe(&self, class_name: &str, filter: JsonValue) -> Result<Arc<Subscription>> {
        self.inner.subscribe(class_name, filter, None, None).await
    }

    /// [`subscribe`](Self::subscribe) with a field projection and session
    /// token.
    pub async fn subscribe_with_options(
        &self,
        class_name: &str,
        filter: JsonValue,
        fields: Option<Vec<String>>,
        session_token: Option<String>,
    ) -> Result<Arc<Subscription>> {
        self.inner.subscribe(class_name, filter, fields, session_token).await
    }

    /// Cancel a subscription and deregister it.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.unsubscribe(subscription.request_id()).await;
    }

    /// Close the connection and stop reconnecting. Terminal.
    pub async fn close(&self, code: u16, reason: &str) {
        self.inner.close(code, reason).await;
    }

    /// [`close`](Self::close) plus graceful draining of queued events,
    /// bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.close(1000, "shutdown").await;
        self.inner.queue.stop(true, timeout).await;
    }

    /// Register the connection-opened callback.
    pub fn on_open(&self, f: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.lock().on_open = Some(Arc::new(f));
        self
    }

    /// Register the connection-closed callback.
    pub fn on_close(&self, f: impl Fn(&CloseReason) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.lock().on_close = Some(Arc::new(f));
        self
    }

    /// Register the connection-error callback.
    pub fn on_error(&self, f: impl Fn(&LiveQueryError) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.lock().on_error = Some(Arc::new(f));
        self
    }

    /// Register the inbound raw-traffic debug hook.
    pub fn on_receive(&self, f: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.lock().on_receive = Some(Arc::new(f));
        self
    }

    /// Register the outbound raw-traffic debug hook.
    pub fn on_send(&self, f: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.lock().on_send = Some(Arc::new(f));
        self
    }

    /// Current connection phase.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// `true` once the `connected` handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server-assigned client id of the current session.
    pub fn client_id(&self) -> Option<String> {
        self.inner.state.lock().client_id.clone()
    }

    /// Snapshot of every registered subscription.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .inner
            .subscriptions
            .lock()
            .values()
            .map(|sub| SubscriptionInfo {
                request_id: sub.request_id(),
                class_name: sub.class_name().to_string(),
                state: sub.state(),
            })
            .collect();
        infos.sort_by_key(|info| info.request_id);
        infos
    }

    /// Event queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Circuit breaker state.
    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    /// Liveness snapshot of the current connection, when one is up.
    pub fn health_info(&self) -> Option<HealthInfo> {
        self.inner.health.lock().as_ref().map(|monitor| monitor.health_info())
    }
}

impl fmt::Debug for LiveQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.state())
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    fn subscription(&self, request_id: u64) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(&request_id).cloned()
    }

    fn handlers_snapshot(&self) -> ConnectionHandlers {
        self.handlers.lock().clone()
    }

    fn emit_error(&self, error: &LiveQueryError) {
        self.handlers_snapshot().emit_error(error);
    }

    fn emit_close(&self, reason: &CloseReason) {
        self.handlers_snapshot().emit_close(reason);
    }

    async fn connect(self: &Arc<Self>) -> Result<bool> {
        {
            let state = self.state.lock();
            match state.phase {
                ConnectionState::Closed => return Err(LiveQueryError::ClientClosed),
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(true),
                ConnectionState::Disconnected => {}
            }
        }

        if !self.breaker.allow_request() {
            log::warn!("[livequery] circuit breaker open, connection attempt denied");
            self.emit_error(&LiveQueryError::Connection(
                "circuit breaker open, connection attempt denied".into(),
            ));
            if self.auto_reconnect() {
                self.schedule_reconnect();
            }
            return Ok(false);
        }

        {
            let mut state = self.state.lock();
            match state.phase {
                ConnectionState::Closed => return Err(LiveQueryError::ClientClosed),
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(true),
                ConnectionState::Disconnected => state.phase = ConnectionState::Connecting,
            }
        }

        match self.establish().await {
            Ok(()) => Ok(true),
            Err(error) => {
                if error.is_connection_error() {
                    self.breaker.record_failure_with_reason(Some(error.to_string()));
                }
                let epoch = self.state.lock().epoch;
                self.drop_connection(epoch, true).await;
                log::warn!("[livequery] connection attempt failed: {}", error);
                self.emit_error(&error);
                if self.auto_reconnect() {
                    self.schedule_reconnect();
                }
                Err(error)
            }
        }
    }

    /// Open the socket, upgrade, start the reader, send `connect`.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let endpoint = transport::parse_endpoint(&self.config.endpoint)?;
        log::info!("[livequery] connecting to {}", self.config.endpoint);
        let connect_timeout = self.config.timeouts.connect_timeout;

        let mut stream = transport::connect(&endpoint, &self.config.tls, connect_timeout).await?;
        frame::client_handshake(&mut stream, &endpoint.host_header(), &endpoint.path, connect_timeout)
            .await?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        let epoch = {
            let mut state = self.state.lock();
            if state.phase == ConnectionState::Closed {
                return Err(LiveQueryError::ClientClosed);
            }
            state.epoch += 1;
            state.epoch
        };
        let reader = tokio::spawn(reader_loop(self.clone(), read_half, epoch));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }

        self.send_message(&ClientMessage::connect(&self.config.credentials)).await
    }

    /// The server accepted the session.
    async fn on_connected(self: &Arc<Self>, client_id: String) {
        log::info!("[livequery] connected, client id {}", client_id);
        {
            let mut state = self.state.lock();
            if state.phase == ConnectionState::Closed {
                return;
            }
            state.phase = ConnectionState::Connected;
            state.client_id = Some(client_id.clone());
        }
        self.breaker.record_success();
        self.reconnect.lock().policy.reset();
        self.queue
            .start(Arc::new(|subscription: Arc<Subscription>, event: Event| {
                subscription.handle_event(&event)
            }));
        self.start_health();
        self.resubscribe_all().await;
        self.handlers_snapshot().emit_open(&client_id);
    }

    fn start_health(self: &Arc<Self>) {
        let timeouts: &Timeouts = &self.config.timeouts;
        if timeouts.ping_interval.is_zero() {
            return;
        }
        let ping_target = Arc::downgrade(self);
        let stale_target = Arc::downgrade(self);
        let monitor = HealthMonitor::new(
            timeouts.ping_interval,
            timeouts.pong_timeout,
            move || {
                if let Some(inner) = ping_target.upgrade() {
                    tokio::spawn(async move {
                        if let Err(error) = inner.send_frame(Opcode::Ping, b"").await {
                            log::warn!("[livequery] ping send failed: {}", error);
                        }
                    });
                }
            },
            move || {
                if let Some(inner) = stale_target.upgrade() {
                    tokio::spawn(async move {
                        inner.on_stale().await;
                    });
                }
            },
        );
        monitor.start();
        if let Some(previous) = self.health.lock().replace(monitor) {
            previous.stop();
        }
    }

    /// The health monitor declared the connection dead.
    async fn on_stale(self: &Arc<Self>) {
        let epoch = self.state.lock().epoch;
        if self.drop_connection(epoch, true).await {
            self.breaker
                .record_failure_with_reason(Some("stale connection: no pong before timeout".into()));
            self.emit_close(&CloseReason::new("connection stale: no pong before timeout"));
            if self.auto_reconnect() {
                self.schedule_reconnect();
            }
        }
    }

    /// Tear down the active socket if `epoch` is still current.
    ///
    /// Returns `true` when this call performed the teardown; concurrent
    /// teardown attempts (reader exit racing the health monitor) make it a
    /// no-op for all but one caller.
    async fn drop_connection(&self, epoch: u64, abort_reader: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.phase == ConnectionState::Closed {
                return false;
            }
            state.phase = ConnectionState::Disconnected;
            state.client_id = None;
            state.epoch += 1;
        }
        let reader = self.reader.lock().take();
        if abort_reader {
            if let Some(handle) = reader {
                handle.abort();
            }
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }
        true
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect() || self.state.lock().phase == ConnectionState::Closed {
            return;
        }
        let delay = {
            let mut control = self.reconnect.lock();
            // One pending timer at most; replace, never stack.
            if let Some(pending) = control.pending.take() {
                pending.abort();
            }
            control.policy.next_delay()
        };
        log::info!("[livequery] reconnecting in {:?}", delay);
        let target = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = target.upgrade() {
                if let Err(error) = inner.connect().await {
                    log::warn!("[livequery] reconnect attempt failed: {}", error);
                }
            }
        });
        self.reconnect.lock().pending = Some(handle);
    }

    async fn subscribe(
        self: &Arc<Self>,
        class_name: &str,
        filter: JsonValue,
        fields: Option<Vec<String>>,
        session_token: Option<String>,
    ) -> Result<Arc<Subscription>> {
        if self.state.lock().phase == ConnectionState::Closed {
            return Err(LiveQueryError::ClientClosed);
        }
        let transport: Weak<dyn SubscriptionTransport> = self.self_ref.clone();
        let subscription = Subscription::new(
            transport,
            &self.request_ids,
            class_name,
            filter,
            fields,
            session_token,
        );
        self.subscriptions.lock().insert(subscription.request_id(), subscription.clone());

        if self.state.lock().phase == ConnectionState::Connected {
            if let Err(error) = self.send_message(&subscription.subscribe_message()).await {
                log::warn!(
                    "[livequery] subscribe send for {} failed, will resend after reconnect: {}",
                    subscription.request_id(),
                    error
                );
            }
        } else if self.config.auto_connect {
            // Failures surface through on_error and the retry scheduler;
            // the subscription stays registered either way.
            let _ = self.connect().await;
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, request_id: u64) {
        let subscription = self.subscriptions.lock().remove(&request_id);
        let Some(subscription) = subscription else { return };
        if self.state.lock().phase == ConnectionState::Connected {
            if let Err(error) = self.send_message(&subscription.unsubscribe_message()).await {
                log::debug!("[livequery] unsubscribe send for {} failed: {}", request_id, error);
            }
        }
        subscription.mark_unsubscribed();
    }

    /// Resend subscribe messages for every registered subscription.
    ///
    /// Runs after each `connected` handshake. Subscriptions the server
    /// already knows answer with a duplicate confirmation, which
    /// [`Subscription::confirm`] treats as a no-op.
    async fn resubscribe_all(&self) {
        let mut subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.lock().values().cloned().collect();
        if subscriptions.is_empty() {
            return;
        }
        subscriptions.sort_by_key(|sub| sub.request_id());
        log::info!("[livequery] resubscribing {} subscription(s)", subscriptions.len());
        for subscription in subscriptions {
            if let Err(error) = self.send_message(&subscription.subscribe_message()).await {
                log::warn!(
                    "[livequery] resubscribe of {} failed: {}",
                    subscription.request_id(),
                    error
                );
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(pending) = self.reconnect.lock().pending.take() {
            pending.abort();
        }
        let was_connected = {
            let mut state = self.state.lock();
            if state.phase == ConnectionState::Closed {
                return;
            }
            let was_connected = state.phase == ConnectionState::Connected;
            state.phase = ConnectionState::Closed;
            state.client_id = None;
            state.epoch += 1;
            was_connected
        };
        if was_connected {
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            let _ = self.send_frame(Opcode::Close, &payload).await;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }
        self.emit_close(&CloseReason::with_code(format!("closed by client: {}", reason), code));
        log::info!("[livequery] client closed ({})", reason);
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.handlers_snapshot().emit_send(&payload);
        self.send_frame(Opcode::Text, payload.as_bytes()).await
    }

    async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => frame::write_frame(writer, opcode, payload).await,
            None => Err(LiveQueryError::Connection("not connected".into())),
        }
    }

    fn note_activity(&self) {
        if let Some(monitor) = self.health.lock().as_ref() {
            monitor.record_activity();
        }
    }

    fn note_pong(&self) {
        if let Some(monitor) = self.health.lock().as_ref() {
            monitor.record_pong();
        }
    }

    /// Dispatch one JSON message from the reader task.
    async fn process_server_message(self: &Arc<Self>, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                // Malformed JSON does not make the socket unusable; skip
                // the frame.
                log::warn!("[livequery] skipping malformed server message: {}", error);
                return;
            }
        };
        match message {
            ServerMessage::Connected { client_id } => self.on_connected(client_id).await,
            ServerMessage::Subscribed { request_id } => match self.subscription(request_id) {
                Some(subscription) => subscription.confirm(),
                None => log::debug!("[livequery] subscribed ack for unknown request {}", request_id),
            },
            ServerMessage::Unsubscribed { request_id } => {
                let subscription = self.subscriptions.lock().remove(&request_id);
                if let Some(subscription) = subscription {
                    subscription.mark_unsubscribed();
                }
            }
            ServerMessage::Create(payload) => self.dispatch_event(EventKind::Create, payload).await,
            ServerMessage::Update(payload) => self.dispatch_event(EventKind::Update, payload).await,
            ServerMessage::Delete(payload) => self.dispatch_event(EventKind::Delete, payload).await,
            ServerMessage::Enter(payload) => self.dispatch_event(EventKind::Enter, payload).await,
            ServerMessage::Leave(payload) => self.dispatch_event(EventKind::Leave, payload).await,
            ServerMessage::Error { request_id, error, code, reconnect } => {
                self.on_server_error(request_id, error, code, reconnect)
            }
        }
    }

    /// Build an [`Event`] and queue it with its owning subscription.
    async fn dispatch_event(&self, kind: EventKind, payload: EventPayload) {
        let Some(subscription) = self.subscription(payload.request_id) else {
            log::debug!("[livequery] {} event for unknown request {}", kind, payload.request_id);
            return;
        };
        let class_name = subscription.class_name();
        let object = self.decoder.build(class_name, payload.object);
        let original = payload.original.map(|raw| self.decoder.build(class_name, raw));
        let event = Event::new(kind, object, original, payload.request_id);
        // Callbacks must never run on the reader task; delivery goes
        // through the queue consumer.
        self.queue.enqueue(subscription, event).await;
    }

    fn on_server_error(
        &self,
        request_id: Option<u64>,
        error: String,
        code: Option<i32>,
        reconnect: Option<bool>,
    ) {
        if reconnect == Some(false) {
            log::warn!("[livequery] server disabled reconnection: {}", error);
            self.auto_reconnect.store(false, Ordering::SeqCst);
        }
        match request_id.and_then(|id| self.subscription(id)) {
            Some(subscription) => {
                subscription.fail(&LiveQueryError::Subscription {
                    request_id: subscription.request_id(),
                    code,
                    message: error,
                });
            }
            None => {
                let message = match code {
                    Some(code) => format!("server error {}: {}", code, error),
                    None => format!("server error: {}", error),
                };
                self.emit_error(&LiveQueryError::Connection(message));
            }
        }
    }
}

impl SubscriptionTransport for ClientInner {
    fn request_unsubscribe(&self, request_id: u64) {
        if let Some(inner) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                inner.unsubscribe(request_id).await;
            });
        }
    }
}

/// Frame-reader task: the only producer of "message received" facts.
async fn reader_loop(inner: Arc<ClientInner>, mut reader: ReadHalf<Stream>, epoch: u64) {
    let max_payload = inner.config.max_message_size;
    let read_timeout = inner.config.timeouts.read_timeout;

    let reason = loop {
        let frame = match frame::read_frame(&mut reader, max_payload, read_timeout).await {
            Ok(frame) => frame,
            Err(error) => {
                if !inner.is_current_epoch(epoch) {
                    return;
                }
                break CloseReason::new(error.to_string());
            }
        };
        inner.note_activity();
        match frame.opcode {
            Opcode::Text => {
                let text = String::from_utf8_lossy(&frame.payload).into_owned();
                inner.handlers_snapshot().emit_receive(&text);
                inner.process_server_message(&text).await;
            }
            Opcode::Ping => {
                // Echo the payload back, per the framing rules.
                if let Err(error) = inner.send_frame(Opcode::Pong, &frame.payload).await {
                    log::debug!("[livequery] pong send failed: {}", error);
                }
            }
            Opcode::Pong => inner.note_pong(),
            Opcode::Close => {
                break match frame.close_code() {
                    Some(code) => CloseReason::with_code("server closed the connection", code),
                    None => CloseReason::new("server closed the connection"),
                };
            }
            Opcode::Binary | Opcode::Continuation => {
                // Not part of this sub-protocol.
                log::warn!("[livequery] ignoring unsupported {:?} frame", frame.opcode);
            }
        }
        if !inner.is_current_epoch(epoch) {
            return;
        }
    };

    if !inner.is_current_epoch(epoch) {
        return;
    }
    log::warn!("[livequery] connection lost: {}", reason);
    if inner.drop_connection(epoch, false).await {
        inner.breaker.record_failure_with_reason(Some(reason.message.clone()));
        inner.emit_close(&reason);
        if inner.auto_reconnect() {
            inner.schedule_reconnect();
        }
    }
}

/// Builder for [`LiveQueryClient`].
pub struct LiveQueryClientBuilder {
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    config: ClientConfig,
    handlers: ConnectionHandlers,
    decoder: SharedDecoder,
    request_ids: Arc<RequestIdSequence>,
}

impl LiveQueryClientBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            credentials: None,
            config: ClientConfig::new("", Credentials::new("")),
            handlers: ConnectionHandlers::default(),
            decoder: Arc::new(JsonDecoder),
            request_ids: RequestIdSequence::shared(),
        }
    }

    /// Server endpoint, `ws://…` or `wss://…`. Required.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Application credentials. Required.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Connect implicitly on `subscribe` while disconnected. Default: true.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Reconnect after unexpected disconnects. Default: true.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Connection and liveness time bounds.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Reconnect backoff tuning.
    pub fn reconnect_options(mut self, options: crate::config::ReconnectOptions) -> Self {
        self.config.reconnect = options;
        self
    }

    /// Circuit breaker thresholds.
    pub fn breaker_options(mut self, options: crate::config::BreakerOptions) -> Self {
        self.config.breaker = options;
        self
    }

    /// Event queue sizing and overflow policy.
    pub fn queue_options(mut self, options: crate::config::QueueOptions) -> Self {
        self.config.queue = options;
        self
    }

    /// Frame payload size limit.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// TLS behavior for `wss://` endpoints.
    pub fn tls_options(mut self, options: crate::config::TlsOptions) -> Self {
        self.config.tls = options;
        self
    }

    /// Connection lifecycle handlers (can also be registered after build).
    pub fn handlers(mut self, handlers: ConnectionHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Object decoder bridging to the application's mapping layer.
    pub fn decoder(mut self, decoder: impl ObjectDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Request-id sequence; inject a private one for isolated id spaces.
    pub fn request_ids(mut self, sequence: Arc<RequestIdSequence>) -> Self {
        self.request_ids = sequence;
        self
    }

    /// Build the client, validating the endpoint.
    pub fn build(self) -> Result<LiveQueryClient> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| LiveQueryError::Config("endpoint is required".into()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| LiveQueryError::Config("credentials are required".into()))?;
        let mut config = self.config;
        config.endpoint = endpoint;
        config.credentials = credentials;
        LiveQueryClient::from_parts(config, self.handlers, self.decoder, self.request_ids)
    }
}
