//! Realtime Stream Manager
//!
//! At most one live tick socket per user, with symbol subscriptions
//! multiplexed over it.
//!
//! # Lifecycle
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> (RECONNECTING -> CONNECTING)* -> DISCONNECTED
//! ```
//!
//! - A second `start_user_stream` for the same user attaches another sink
//!   to the existing stream; it never opens a second socket.
//! - Unexpected closes and heartbeat timeouts reconnect with exponential
//!   backoff. Once the attempt budget is spent the stream is dropped and the
//!   caller must start it again.
//! - After a reconnect the accumulated symbol set is replayed (configurable).
//! - Ticks reach sinks in socket order. Malformed frames are logged and
//!   dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{TickSink, TickStreaming};
use crate::application::services::session_repository::SessionRepository;
use crate::domain::session::{BrokerSession, UserId};
use crate::domain::streaming::{InstrumentKey, StreamState, Tick};
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::breeze::codec::{PING_TEXT, decode_text};
use crate::infrastructure::breeze::{
    ControlAction, ControlFrame, HeartbeatConfig, HeartbeatEvent, HeartbeatManager,
    HeartbeatState, InboundFrame, ReconnectConfig, ReconnectPolicy,
};
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 64;

// =============================================================================
// Error Type
// =============================================================================

/// Socket-level failures inside a stream loop.
#[derive(Debug, thiserror::Error)]
enum StreamError {
    /// WebSocket protocol or I/O error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Control frame could not be encoded.
    #[error("control frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No traffic within the pong timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream manager.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamManagerConfig {
    /// WebSocket URL of the tick feed.
    pub stream_url: String,
    /// Ping interval and pong timeout.
    pub heartbeat: HeartbeatConfig,
    /// Backoff and attempt cap.
    pub reconnect: ReconnectConfig,
    /// Resend the symbol set after a reconnect.
    pub replay_subscriptions: bool,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            stream_url: "wss://livestream.icicidirect.com/".to_string(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            replay_subscriptions: true,
        }
    }
}

// =============================================================================
// Per-user Stream
// =============================================================================

struct UserStream {
    user_id: UserId,
    state: Mutex<StreamState>,
    symbols: Mutex<BTreeSet<InstrumentKey>>,
    sinks: Mutex<Vec<(u64, TickSink)>>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl UserStream {
    fn new(user_id: UserId, cancel: CancellationToken) -> (Self, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let stream = Self {
            user_id,
            state: Mutex::new(StreamState::Connecting),
            symbols: Mutex::new(BTreeSet::new()),
            sinks: Mutex::new(Vec::new()),
            outbound,
            cancel,
        };
        (stream, outbound_rx)
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn set_state(&self, next: StreamState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            tracing::debug!(user_id = %self.user_id, from = %previous, to = %next, "Stream state");
        }
    }

    fn add_sink(&self, id: u64, sink: TickSink) {
        self.sinks.lock().push((id, sink));
    }

    fn remove_sink(&self, id: u64) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    fn has_sink(&self, id: u64) -> bool {
        self.sinks.lock().iter().any(|(sink_id, _)| *sink_id == id)
    }

    /// Invoke every sink, outside the lock so a sink may dispose itself.
    fn deliver(&self, tick: &Tick) {
        if self.cancel.is_cancelled() {
            return;
        }
        let sinks: Vec<TickSink> = self.sinks.lock().iter().map(|(_, s)| s.clone()).collect();
        for sink in &sinks {
            sink(tick);
        }
        metrics::record_ticks_delivered(1);
    }

    fn symbols(&self) -> Vec<InstrumentKey> {
        self.symbols.lock().iter().cloned().collect()
    }

    fn shut_down(&self) {
        self.cancel.cancel();
        self.sinks.lock().clear();
        self.set_state(StreamState::Disconnected);
    }
}

/// Handle for one registered tick sink.
///
/// Dropping the handle, or calling [`TickSubscription::dispose`],
/// unregisters the sink. The stream itself keeps running until it is
/// stopped explicitly.
#[derive(Debug)]
pub struct TickSubscription {
    user_id: UserId,
    sink_id: u64,
    stream: Weak<UserStream>,
}

impl TickSubscription {
    /// User the sink listens for.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether the sink is still registered on a live stream.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stream
            .upgrade()
            .is_some_and(|stream| !stream.cancel.is_cancelled() && stream.has_sink(self.sink_id))
    }

    /// Unregister the sink.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for TickSubscription {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.upgrade() {
            if stream.remove_sink(self.sink_id) {
                tracing::debug!(user_id = %self.user_id, sink_id = self.sink_id, "Tick sink removed");
            }
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct ManagerInner {
    config: StreamManagerConfig,
    repo: SessionRepository,
    streams: Mutex<HashMap<UserId, Arc<UserStream>>>,
    shutdown: CancellationToken,
    next_sink_id: AtomicU64,
}

impl ManagerInner {
    fn publish_gauge(&self) {
        metrics::set_active_streams(self.streams.lock().len());
    }

    /// Remove `stream` from the registry if it is still the registered one.
    fn remove_if_current(&self, stream: &Arc<UserStream>) {
        {
            let mut streams = self.streams.lock();
            if streams
                .get(&stream.user_id)
                .is_some_and(|current| Arc::ptr_eq(current, stream))
            {
                streams.remove(&stream.user_id);
            }
        }
        self.publish_gauge();
    }

    async fn resolve_session(&self, user_id: &UserId) -> GatewayResult<BrokerSession> {
        let session = self
            .repo
            .resolve(user_id)
            .await?
            .ok_or_else(|| GatewayError::not_connected(user_id))?;

        if !session.has_credentials() {
            return Err(GatewayError::invalid_session("api key or secret missing"));
        }
        if session.session_token.as_deref().is_none_or(str::is_empty) {
            return Err(GatewayError::invalid_session("session token missing"));
        }
        Ok(session)
    }

    /// Open an authenticated socket for the user's current session.
    async fn connect(&self, user_id: &UserId) -> GatewayResult<WsStream> {
        let session = self.resolve_session(user_id).await?;
        let token = session.session_token.as_deref().unwrap_or_default();

        let mut request = self
            .config
            .stream_url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Configuration(format!("invalid stream URL: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("X-AppKey", header_value(&session.api_key)?);
        headers.insert("X-SessionToken", header_value(token)?);

        tracing::info!(user_id = %user_id, url = %self.config.stream_url, "Connecting tick stream");

        match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _response)) => Ok(socket),
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                tracing::warn!(user_id = %user_id, "Tick stream rejected the session token");
                if let Err(err) = self.repo.invalidate(user_id).await {
                    tracing::error!(error = %err, "Failed to invalidate session after stream 401");
                }
                Err(GatewayError::SessionExpiredRemote)
            }
            Err(err) => Err(GatewayError::StreamUnavailable(err.to_string())),
        }
    }
}

fn header_value(value: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| GatewayError::invalid_session("credential contains characters not allowed in headers"))
}

/// Whether a connect failure should end the stream instead of backing off.
const fn is_fatal(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::NotConnected { .. }
            | GatewayError::InvalidSession { .. }
            | GatewayError::SessionExpiredRemote
            | GatewayError::Configuration(_)
    )
}

/// Per-user realtime tick streams.
#[derive(Clone)]
pub struct RealtimeStreamManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for RealtimeStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeStreamManager")
            .field("stream_url", &self.inner.config.stream_url)
            .field("active_streams", &self.active_streams())
            .finish_non_exhaustive()
    }
}

impl RealtimeStreamManager {
    /// Create a manager. Streams are cancelled when `shutdown` fires.
    #[must_use]
    pub fn new(
        repo: SessionRepository,
        config: StreamManagerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                repo,
                streams: Mutex::new(HashMap::new()),
                shutdown,
                next_sink_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of registered streams.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Lifecycle state of a user's stream, if one exists.
    #[must_use]
    pub fn stream_state(&self, user_id: &UserId) -> Option<StreamState> {
        self.stream(user_id).map(|stream| stream.state())
    }

    /// Instruments currently subscribed for a user.
    #[must_use]
    pub fn subscriptions(&self, user_id: &UserId) -> Vec<InstrumentKey> {
        self.stream(user_id)
            .map(|stream| stream.symbols())
            .unwrap_or_default()
    }

    /// Stop every stream.
    pub fn stop_all(&self) {
        let drained: Vec<Arc<UserStream>> = self.inner.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in &drained {
            stream.shut_down();
        }
        self.inner.publish_gauge();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "All tick streams stopped");
        }
    }

    fn stream(&self, user_id: &UserId) -> Option<Arc<UserStream>> {
        self.inner.streams.lock().get(user_id).cloned()
    }

    fn subscription(&self, stream: &Arc<UserStream>, sink: TickSink) -> TickSubscription {
        let sink_id = self.inner.next_sink_id.fetch_add(1, Ordering::Relaxed);
        stream.add_sink(sink_id, sink);
        TickSubscription {
            user_id: stream.user_id.clone(),
            sink_id,
            stream: Arc::downgrade(stream),
        }
    }

    async fn send_control(
        &self,
        user_id: &UserId,
        action: ControlAction,
        symbol: &str,
        exchange: &str,
    ) -> GatewayResult<()> {
        if symbol.trim().is_empty() || exchange.trim().is_empty() {
            return Err(GatewayError::StreamUnavailable(
                "symbol and exchange are required".to_string(),
            ));
        }
        let key = InstrumentKey::new(exchange.trim(), symbol.trim());

        let Some(stream) = self.stream(user_id) else {
            tracing::debug!(user_id = %user_id, instrument = %key, "No stream, control frame skipped");
            return Ok(());
        };
        if !stream.state().is_connected() {
            tracing::debug!(
                user_id = %user_id,
                instrument = %key,
                state = %stream.state(),
                "Stream not connected, control frame skipped"
            );
            return Ok(());
        }

        let changed = {
            let mut symbols = stream.symbols.lock();
            match action {
                ControlAction::Subscribe => symbols.insert(key.clone()),
                ControlAction::Unsubscribe => symbols.remove(&key),
            }
        };
        if !changed {
            return Ok(());
        }

        let text = ControlFrame::new(action, &key)
            .to_text()
            .map_err(|e| GatewayError::StreamUnavailable(e.to_string()))?;

        if stream.outbound.send(text).await.is_err() {
            // Stream loop is gone; undo the bookkeeping.
            let mut symbols = stream.symbols.lock();
            match action {
                ControlAction::Subscribe => symbols.remove(&key),
                ControlAction::Unsubscribe => symbols.insert(key.clone()),
            };
            return Err(GatewayError::StreamUnavailable("stream closed".to_string()));
        }

        tracing::debug!(user_id = %user_id, instrument = %key, action = ?action, "Control frame queued");
        Ok(())
    }
}

#[async_trait]
impl TickStreaming for RealtimeStreamManager {
    async fn start_user_stream(
        &self,
        user_id: &UserId,
        sink: TickSink,
    ) -> GatewayResult<TickSubscription> {
        // 1. Attach to an existing stream, or claim the slot before awaiting
        let (stream, outbound_rx) = {
            let mut streams = self.inner.streams.lock();
            if let Some(existing) = streams.get(user_id).cloned() {
                drop(streams);
                tracing::debug!(user_id = %user_id, "Stream exists, sink attached");
                return Ok(self.subscription(&existing, sink));
            }

            let (stream, outbound_rx) =
                UserStream::new(user_id.clone(), self.inner.shutdown.child_token());
            let stream = Arc::new(stream);
            streams.insert(user_id.clone(), stream.clone());
            (stream, outbound_rx)
        };
        self.inner.publish_gauge();
        let subscription = self.subscription(&stream, sink);

        // 2. Connect
        let socket = match self.inner.connect(user_id).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "Tick stream failed to open");
                stream.shut_down();
                self.inner.remove_if_current(&stream);
                return Err(err);
            }
        };

        // 3. Hand the socket to the stream loop
        if stream.cancel.is_cancelled() {
            return Ok(subscription);
        }
        stream.set_state(StreamState::Connected);
        tracing::info!(user_id = %user_id, "Tick stream connected");
        tokio::spawn(run_stream(self.inner.clone(), stream, socket, outbound_rx));

        Ok(subscription)
    }

    async fn stop_user_stream(&self, user_id: &UserId) {
        let removed = self.inner.streams.lock().remove(user_id);
        if let Some(stream) = removed {
            stream.shut_down();
            tracing::info!(user_id = %user_id, "Tick stream stopped");
        }
        self.inner.publish_gauge();
    }

    async fn subscribe(&self, user_id: &UserId, symbol: &str, exchange: &str) -> GatewayResult<()> {
        self.send_control(user_id, ControlAction::Subscribe, symbol, exchange)
            .await
    }

    async fn unsubscribe(
        &self,
        user_id: &UserId,
        symbol: &str,
        exchange: &str,
    ) -> GatewayResult<()> {
        self.send_control(user_id, ControlAction::Unsubscribe, symbol, exchange)
            .await
    }
}

// =============================================================================
// Stream Loop
// =============================================================================

/// Pump the socket, reconnecting until cancelled or out of attempts.
async fn run_stream(
    inner: Arc<ManagerInner>,
    stream: Arc<UserStream>,
    mut socket: WsStream,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut policy = ReconnectPolicy::new(inner.config.reconnect);
    let mut replay = false;

    loop {
        let result = pump(
            &inner.config,
            &stream,
            socket,
            &mut outbound,
            replay,
        )
        .await;

        if stream.cancel.is_cancelled() {
            break;
        }
        if let Err(err) = result {
            tracing::warn!(user_id = %stream.user_id, error = %err, "Tick stream interrupted");
        }

        match reconnect(&inner, &stream, &mut policy, &mut outbound).await {
            Some(next) => {
                socket = next;
                replay = inner.config.replay_subscriptions;
            }
            None => break,
        }
    }

    stream.set_state(StreamState::Disconnected);
    inner.remove_if_current(&stream);
    tracing::debug!(user_id = %stream.user_id, "Tick stream loop exited");
}

/// Back off and reconnect. `None` means the stream is finished.
async fn reconnect(
    inner: &ManagerInner,
    stream: &UserStream,
    policy: &mut ReconnectPolicy,
    outbound: &mut mpsc::Receiver<String>,
) -> Option<WsStream> {
    loop {
        stream.set_state(StreamState::Reconnecting);

        let Some(delay) = policy.next_delay() else {
            tracing::error!(
                user_id = %stream.user_id,
                attempts = policy.attempt_count(),
                "Tick stream reconnect attempts exhausted, dropping stream"
            );
            stream.shut_down();
            return None;
        };
        let attempt = policy.attempt_count();
        metrics::record_stream_reconnect();
        tracing::info!(
            user_id = %stream.user_id,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting tick stream"
        );

        tokio::select! {
            () = stream.cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        stream.set_state(StreamState::Connecting);
        match inner.connect(&stream.user_id).await {
            Ok(socket) => {
                // Frames queued for the dead socket are covered by the replay.
                while outbound.try_recv().is_ok() {}
                if stream.cancel.is_cancelled() {
                    return None;
                }
                policy.reset();
                if !inner.config.replay_subscriptions {
                    stream.symbols.lock().clear();
                }
                stream.set_state(StreamState::Connected);
                tracing::info!(user_id = %stream.user_id, attempt, "Tick stream reconnected");
                return Some(socket);
            }
            Err(err) if is_fatal(&err) => {
                tracing::warn!(user_id = %stream.user_id, error = %err, "Tick stream cannot reconnect");
                stream.shut_down();
                return None;
            }
            Err(err) => {
                tracing::warn!(user_id = %stream.user_id, attempt, error = %err, "Reconnect attempt failed");
            }
        }
    }
}

/// Run one connection until it fails or the stream is cancelled.
async fn pump(
    config: &StreamManagerConfig,
    stream: &UserStream,
    socket: WsStream,
    outbound: &mut mpsc::Receiver<String>,
    replay: bool,
) -> Result<(), StreamError> {
    let (mut write, mut read) = socket.split();

    if replay {
        let symbols = stream.symbols();
        for key in &symbols {
            let text = ControlFrame::new(ControlAction::Subscribe, key).to_text()?;
            write.send(Message::Text(text.into())).await?;
        }
        if !symbols.is_empty() {
            tracing::info!(user_id = %stream.user_id, count = symbols.len(), "Subscriptions replayed");
        }
    }

    // Heartbeat
    let heartbeat_state = Arc::new(HeartbeatState::new());
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
    let heartbeat_cancel = stream.cancel.child_token();
    let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
    tokio::spawn(
        HeartbeatManager::new(
            config.heartbeat,
            heartbeat_state.clone(),
            heartbeat_tx,
            heartbeat_cancel,
        )
        .run(),
    );

    loop {
        tokio::select! {
            biased;

            () = stream.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            event = heartbeat_rx.recv() => match event {
                Some(HeartbeatEvent::SendPing) => {
                    heartbeat_state.mark_ping_sent();
                    write.send(Message::Text(PING_TEXT.to_string().into())).await?;
                }
                Some(HeartbeatEvent::Timeout) | None => return Err(StreamError::HeartbeatTimeout),
            },
            frame = outbound.recv() => {
                if let Some(text) = frame {
                    write.send(Message::Text(text.into())).await?;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    heartbeat_state.record_activity();
                    handle_text(stream, text.as_str());
                }
                Some(Ok(Message::Pong(_))) => heartbeat_state.record_pong(),
                Some(Ok(Message::Ping(data))) => {
                    heartbeat_state.record_activity();
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Err(StreamError::ConnectionClosed),
                Some(Ok(_)) => heartbeat_state.record_activity(),
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

fn handle_text(stream: &UserStream, text: &str) {
    match decode_text(text) {
        InboundFrame::Pong => {}
        InboundFrame::Tick(tick) => stream.deliver(&tick),
        InboundFrame::Malformed(reason) => {
            metrics::record_malformed_tick();
            tracing::warn!(user_id = %stream.user_id, reason = %reason, "Dropping malformed tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::infrastructure::cache::SessionCache;
    use crate::infrastructure::persistence::InMemoryCredentialStore;

    fn tick(symbol: &str) -> Tick {
        match decode_text(&format!(r#"{{"symbol":"{symbol}","ltp":101.5}}"#)) {
            InboundFrame::Tick(tick) => tick,
            other => panic!("expected tick, got {other:?}"),
        }
    }

    fn counting_sink(counter: &Arc<AtomicUsize>) -> TickSink {
        let counter = counter.clone();
        Arc::new(move |_tick: &Tick| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn offline_manager(store: Arc<InMemoryCredentialStore>) -> RealtimeStreamManager {
        let repo = SessionRepository::new(store, Arc::new(SessionCache::default()));
        RealtimeStreamManager::new(
            repo,
            StreamManagerConfig {
                stream_url: "ws://127.0.0.1:9/".to_string(),
                ..StreamManagerConfig::default()
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn default_config() {
        let config = StreamManagerConfig::default();
        assert!(config.replay_subscriptions);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.heartbeat.ping_interval.as_secs(), 30);
    }

    #[test]
    fn sinks_receive_ticks_in_order() {
        let (stream, _rx) = UserStream::new(UserId::new("u1"), CancellationToken::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        stream.add_sink(
            1,
            Arc::new(move |tick: &Tick| sink_seen.lock().push(tick.symbol.clone())),
        );

        for symbol in ["A", "B", "C"] {
            stream.deliver(&tick(symbol));
        }
        assert_eq!(*seen.lock(), vec!["A", "B", "C"]);
        assert_eq!(tick("A").ltp, dec!(101.5));
    }

    #[test]
    fn cancelled_stream_delivers_nothing() {
        let (stream, _rx) = UserStream::new(UserId::new("u1"), CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        stream.add_sink(1, counting_sink(&counter));

        stream.shut_down();
        stream.deliver(&tick("A"));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(stream.state(), StreamState::Disconnected);
    }

    #[test]
    fn dropping_subscription_removes_sink() {
        let (stream, _rx) = UserStream::new(UserId::new("u1"), CancellationToken::new());
        let stream = Arc::new(stream);
        let counter = Arc::new(AtomicUsize::new(0));
        stream.add_sink(7, counting_sink(&counter));

        let subscription = TickSubscription {
            user_id: UserId::new("u1"),
            sink_id: 7,
            stream: Arc::downgrade(&stream),
        };
        assert!(subscription.is_active());

        subscription.dispose();
        stream.deliver(&tick("A"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_text_reaches_no_sink() {
        let (stream, _rx) = UserStream::new(UserId::new("u1"), CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        stream.add_sink(1, counting_sink(&counter));

        handle_text(&stream, "{not json");
        handle_text(&stream, r#"{"ltp": 10}"#);
        handle_text(&stream, "pong");

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_without_session_is_not_connected() {
        let manager = offline_manager(Arc::new(InMemoryCredentialStore::new()));
        let result = manager
            .start_user_stream(&UserId::new("ghost"), Arc::new(|_: &Tick| {}))
            .await;

        assert!(matches!(result, Err(GatewayError::NotConnected { .. })));
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn start_without_token_is_invalid_session() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(BrokerSession::new(UserId::new("u1"), "key", "secret"));
        let manager = offline_manager(store);

        let result = manager
            .start_user_stream(&UserId::new("u1"), Arc::new(|_: &Tick| {}))
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidSession { .. })));
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn control_frames_without_stream_are_noops() {
        let manager = offline_manager(Arc::new(InMemoryCredentialStore::new()));
        let user = UserId::new("u1");

        manager.subscribe(&user, "INFY", "NSE").await.unwrap();
        manager.unsubscribe(&user, "INFY", "NSE").await.unwrap();
        assert!(manager.subscriptions(&user).is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = offline_manager(Arc::new(InMemoryCredentialStore::new()));
        let user = UserId::new("u1");
        manager.stop_user_stream(&user).await;
        manager.stop_user_stream(&user).await;
        assert_eq!(manager.stream_state(&user), None);
    }

    #[test]
    fn fatal_connect_errors() {
        assert!(is_fatal(&GatewayError::SessionExpiredRemote));
        assert!(is_fatal(&GatewayError::not_connected("u1")));
        assert!(!is_fatal(&GatewayError::StreamUnavailable("refused".to_string())));
    }
}
