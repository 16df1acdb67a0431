//! The reconnecting socket client.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use relay_bus::EventBus;
use relay_core::events;
use relay_settings::WsSettings;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{CloseInfo, Outbound, pump};
use crate::errors::WsError;
use crate::heartbeat::{HeartbeatResult, Liveness, run_heartbeat};
use crate::metrics::{WsMetrics, WsMetricsSnapshot};
use crate::protocol::{self, CLOSE_NORMAL, Message, PONG};
use crate::transport::{Connector, FrameSink, FrameStream, TungsteniteConnector, WireFrame};

/// Reason sent when the caller disconnects.
pub const CLIENT_DISCONNECT_REASON: &str = "client disconnect";

/// Where the client is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Never connected.
    Idle,
    /// An open is in flight.
    Connecting,
    /// Socket open.
    Connected,
    /// Socket lost; a reconnect may be pending.
    Disconnected,
    /// Closed by [`WebSocketClient::disconnect`].
    Terminated,
}

/// Point-in-time view of the connection state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
    /// Whether automatic reconnection is armed.
    pub should_reconnect: bool,
    /// Reconnects scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// Subscribed topics in subscription order.
    pub subscribed_topics: Vec<String>,
    /// Messages waiting for the next open.
    pub queued_messages: usize,
    /// URL of the current or last connection.
    pub url: Option<String>,
}

struct ConnState {
    phase: ConnectionPhase,
    should_reconnect: bool,
    reconnect_attempts: u32,
    topics: Vec<String>,
    queue: VecDeque<Message>,
    url: Option<String>,
    has_connected: bool,
    /// Bumped on every open so stale I/O loops cannot touch a newer socket.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    heartbeat_cancel: Option<CancellationToken>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Inner {
    bus: EventBus,
    connector: Arc<dyn Connector>,
    settings: WsSettings,
    state: Mutex<ConnState>,
    metrics: WsMetrics,
}

/// One live socket to the backend, translated onto the bus.
///
/// Cheap to clone; clones share the connection. Inbound messages are
/// published as `websocket:message` plus a type-specific event. Outbound
/// sends made while offline are queued and flushed on the next open. Lost
/// connections are retried with capped exponential backoff until
/// [`disconnect`](Self::disconnect) is called.
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<Inner>,
}

impl WebSocketClient {
    /// Client using the `tokio-tungstenite` transport.
    pub fn new(bus: EventBus, settings: WsSettings) -> Self {
        Self::with_connector(bus, settings, Arc::new(TungsteniteConnector))
    }

    /// Client using a custom transport.
    pub fn with_connector(bus: EventBus, settings: WsSettings, connector: Arc<dyn Connector>) -> Self {
        let mut topics = Vec::new();
        for topic in &settings.default_topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        Self {
            inner: Arc::new(Inner {
                bus,
                connector,
                state: Mutex::new(ConnState {
                    phase: ConnectionPhase::Idle,
                    should_reconnect: true,
                    reconnect_attempts: 0,
                    topics,
                    queue: VecDeque::with_capacity(settings.queue_capacity),
                    url: None,
                    has_connected: false,
                    generation: 0,
                    outbound: None,
                    heartbeat_cancel: None,
                    reconnect_timer: None,
                }),
                settings,
                metrics: WsMetrics::default(),
            }),
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Open the socket.
    ///
    /// Does nothing while connected or connecting. Without `url` the
    /// configured URL is used, or one derived from the configured origin.
    /// Calling this re-arms automatic reconnection, including after
    /// [`disconnect`](Self::disconnect) or exhausted retries.
    ///
    /// Fails when the open errors or exceeds the connect timeout; a
    /// reconnect is scheduled in both cases.
    pub async fn connect(&self, url: Option<&str>) -> Result<(), WsError> {
        let url = self.resolve_url(url)?;
        {
            let mut state = self.inner.state.lock();
            if matches!(
                state.phase,
                ConnectionPhase::Connected | ConnectionPhase::Connecting
            ) {
                return Ok(());
            }
            state.should_reconnect = true;
            if !self.inner.settings.reconnect.allows(state.reconnect_attempts) {
                state.reconnect_attempts = 0;
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.phase = ConnectionPhase::Connecting;
            state.url = Some(url.clone());
        }
        self.open(url).await
    }

    /// Close the socket for good.
    ///
    /// Disables reconnection, cancels a pending reconnect, stops the
    /// heartbeat, sends close 1000 and clears the offline queue. Topics are
    /// kept for a later [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            state.should_reconnect = false;
            state.reconnect_attempts = 0;
            state.queue.clear();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(cancel) = state.heartbeat_cancel.take() {
                cancel.cancel();
            }
            if let Some(outbound) = state.outbound.take() {
                let _ = outbound.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: CLIENT_DISCONNECT_REASON.to_owned(),
                });
            }
            std::mem::replace(&mut state.phase, ConnectionPhase::Terminated)
        };

        if matches!(previous, ConnectionPhase::Idle | ConnectionPhase::Terminated) {
            return;
        }
        info!("websocket disconnected by client");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_DISCONNECTED,
            json!({ "code": CLOSE_NORMAL, "reason": CLIENT_DISCONNECT_REASON }),
        );
    }

    fn resolve_url(&self, url: Option<&str>) -> Result<String, WsError> {
        let explicit = url
            .map(ToOwned::to_owned)
            .or_else(|| self.inner.settings.url.clone());
        match explicit {
            Some(url) => {
                protocol::validate_ws_url(&url)?;
                Ok(url)
            }
            None => protocol::derive_ws_url(&self.inner.settings.origin, &self.inner.settings.path),
        }
    }

    async fn open(&self, url: String) -> Result<(), WsError> {
        let timeout_ms = self.inner.settings.connect_timeout_ms;
        let attempt = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.inner.connector.connect(&url),
        )
        .await;

        let err = match attempt {
            Ok(Ok((sink, stream))) => {
                self.on_open(url, sink, stream);
                return Ok(());
            }
            Ok(Err(err)) => WsError::Connect {
                url,
                message: err.to_string(),
            },
            Err(_) => WsError::ConnectTimeout { url, timeout_ms },
        };

        WsMetrics::incr(&self.inner.metrics.connection_errors);
        warn!(error = %err, "websocket connection failed");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_ERROR,
            json!({ "kind": err.kind(), "message": err.to_string() }),
        );
        {
            let mut state = self.inner.state.lock();
            if state.phase == ConnectionPhase::Connecting {
                state.phase = ConnectionPhase::Disconnected;
            }
        }
        self.schedule_reconnect();
        Err(err)
    }

    fn on_open(&self, url: String, sink: FrameSink, stream: FrameStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let liveness = Arc::new(Liveness::new());
        let heartbeat_cancel = CancellationToken::new();

        let (generation, reconnected) = {
            let mut state = self.inner.state.lock();
            if state.phase != ConnectionPhase::Connecting {
                // Disconnected while the open was in flight; drop the socket.
                debug!(url = %url, "discarding socket opened after disconnect");
                return;
            }
            state.generation += 1;
            state.phase = ConnectionPhase::Connected;
            state.reconnect_attempts = 0;
            let reconnected = state.has_connected;
            state.has_connected = true;

            if !state.topics.is_empty() {
                let _ = send_message(&tx, &Message::subscribe(&state.topics));
            }
            while let Some(queued) = state.queue.pop_front() {
                if !send_message(&tx, &queued) {
                    WsMetrics::incr(&self.inner.metrics.send_errors);
                }
            }

            state.outbound = Some(tx.clone());
            state.heartbeat_cancel = Some(heartbeat_cancel.clone());
            (state.generation, reconnected)
        };

        // Inbound traffic is only published once the I/O task runs.
        info!(url = %url, reconnected, "websocket connected");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_CONNECTED,
            json!({ "url": url, "reconnected": reconnected }),
        );

        self.spawn_heartbeat(generation, Arc::clone(&liveness), tx, heartbeat_cancel);
        self.spawn_io(generation, sink, stream, rx, liveness);
    }

    fn spawn_io(
        &self,
        generation: u64,
        sink: FrameSink,
        stream: FrameStream,
        rx: mpsc::UnboundedReceiver<Outbound>,
        liveness: Arc<Liveness>,
    ) {
        let client = self.clone();
        let _ = tokio::spawn(async move {
            let inner = Arc::clone(&client.inner);
            let info = pump(sink, stream, rx, &liveness, &inner.metrics, |text| {
                client.handle_text(&text);
            })
            .await;
            client.handle_close(generation, info);
        });
    }

    fn spawn_heartbeat(
        &self,
        generation: u64,
        liveness: Arc<Liveness>,
        outbound: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) {
        let timeout_ms = self.inner.settings.heartbeat_timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let _ = tokio::spawn(async move {
            let result = run_heartbeat(&liveness, outbound, timeout, cancel).await;
            if result == HeartbeatResult::TimedOut {
                if let Some(inner) = weak.upgrade() {
                    WsMetrics::incr(&inner.metrics.heartbeat_timeouts);
                    warn!(
                        generation,
                        timeout_ms,
                        "websocket heartbeat timed out, closing"
                    );
                }
            }
        });
    }

    fn handle_close(&self, generation: u64, info: CloseInfo) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.phase != ConnectionPhase::Connected {
                return;
            }
            state.phase = ConnectionPhase::Disconnected;
            state.outbound = None;
            if let Some(cancel) = state.heartbeat_cancel.take() {
                cancel.cancel();
            }
        }

        if let Some(error) = &info.error {
            WsMetrics::incr(&self.inner.metrics.connection_errors);
            let _ = self.inner.bus.emit(
                events::WEBSOCKET_ERROR,
                json!({ "kind": "transport", "message": error }),
            );
        }
        info!(code = info.code, reason = %info.reason, "websocket closed");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_DISCONNECTED,
            json!({ "code": info.code, "reason": info.reason }),
        );

        if info.code != CLOSE_NORMAL {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let policy = &self.inner.settings.reconnect;
        let mut state = self.inner.state.lock();
        if !state.should_reconnect || state.phase != ConnectionPhase::Disconnected {
            return;
        }

        let attempt = state.reconnect_attempts + 1;
        let Some(delay_ms) = policy.delay_for_attempt(attempt) else {
            let attempts = state.reconnect_attempts;
            drop(state);
            error!(attempts, "websocket reconnection failed, giving up");
            let _ = self.inner.bus.emit(
                events::WEBSOCKET_RECONNECT_FAILED,
                json!({ "attempts": attempts }),
            );
            return;
        };

        state.reconnect_attempts = attempt;
        WsMetrics::incr(&self.inner.metrics.reconnect_attempts);
        self.inner
            .metrics
            .last_reconnect_delay_ms
            .store(delay_ms, std::sync::atomic::Ordering::Relaxed);
        if let Some(previous) = state.reconnect_timer.take() {
            previous.abort();
        }

        info!(attempt, delay_ms, "scheduling websocket reconnect");
        let weak = Arc::downgrade(&self.inner);
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(inner) = weak.upgrade() {
                WebSocketClient { inner }.reconnect().await;
            }
        }));
    }

    async fn reconnect(&self) {
        let url = {
            let mut state = self.inner.state.lock();
            // This task is the pending timer; forget it so a failure below
            // can schedule the next one.
            let _ = state.reconnect_timer.take();
            if !state.should_reconnect || state.phase != ConnectionPhase::Disconnected {
                return;
            }
            let Some(url) = state.url.clone() else {
                return;
            };
            state.phase = ConnectionPhase::Connecting;
            url
        };
        let _ = self.open(url).await;
    }

    // ── inbound ─────────────────────────────────────────────────────────────

    fn handle_text(&self, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(err) => return self.report_parse_error(&err.to_string()),
        };
        let message: Message = match serde_json::from_value(raw.clone()) {
            Ok(message) => message,
            Err(err) => return self.report_parse_error(&err.to_string()),
        };

        let _ = self.inner.bus.emit(events::WEBSOCKET_MESSAGE, raw);
        if message.kind == PONG {
            return;
        }
        match protocol::derived_event(&message.kind) {
            Some(event_type) => {
                let _ = self.inner.bus.emit(event_type, message.payload);
            }
            None if self.inner.settings.debug => {
                debug!(kind = %message.kind, "unhandled websocket message type");
            }
            None => {}
        }
    }

    fn report_parse_error(&self, message: &str) {
        WsMetrics::incr(&self.inner.metrics.parse_errors);
        warn!(error = message, "dropping unparseable websocket message");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_ERROR,
            json!({ "kind": "parse", "message": message }),
        );
    }

    // ── outbound ────────────────────────────────────────────────────────────

    /// Send `message`, or queue it while offline.
    ///
    /// Returns `true` once the message is handed to the open socket. While
    /// offline the message is queued (dropping the oldest beyond capacity)
    /// and `false` is returned. A serialization or write failure also
    /// returns `false` and is counted.
    pub fn send(&self, message: &Message) -> bool {
        let outbound = {
            let mut state = self.inner.state.lock();
            let Some(outbound) = connected_outbound(&state).cloned() else {
                self.enqueue(&mut state, message.clone());
                return false;
            };
            outbound
        };

        let failure = match serde_json::to_string(message) {
            Ok(text) => match outbound.send(Outbound::Frame(WireFrame::Text(text))) {
                Ok(()) => return true,
                Err(_) => "socket writer is gone".to_owned(),
            },
            Err(err) => err.to_string(),
        };

        WsMetrics::incr(&self.inner.metrics.send_errors);
        warn!(kind = %message.kind, error = %failure, "websocket send failed");
        let _ = self.inner.bus.emit(
            events::WEBSOCKET_ERROR,
            json!({ "kind": "send", "message": failure }),
        );
        false
    }

    fn enqueue(&self, state: &mut ConnState, message: Message) {
        let capacity = self.inner.settings.queue_capacity;
        if capacity == 0 {
            WsMetrics::incr(&self.inner.metrics.messages_dropped);
            return;
        }
        while state.queue.len() >= capacity {
            let _ = state.queue.pop_front();
            WsMetrics::incr(&self.inner.metrics.messages_dropped);
        }
        state.queue.push_back(message);
        WsMetrics::incr(&self.inner.metrics.messages_queued);
    }

    /// Add topics. Sent immediately when connected; otherwise subscribed
    /// on the next open.
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) {
        let mut state = self.inner.state.lock();
        let mut added = Vec::new();
        for topic in topics.iter().map(AsRef::as_ref) {
            if !state.topics.iter().any(|t| t == topic) {
                state.topics.push(topic.to_owned());
                added.push(topic.to_owned());
            }
        }
        if let Some(outbound) = connected_outbound(&state) {
            if !added.is_empty() && !send_message(outbound, &Message::subscribe(&added)) {
                WsMetrics::incr(&self.inner.metrics.send_errors);
            }
        }
    }

    /// Remove topics. Sent immediately when connected.
    pub fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) {
        let mut state = self.inner.state.lock();
        let mut removed = Vec::new();
        for topic in topics.iter().map(AsRef::as_ref) {
            if let Some(pos) = state.topics.iter().position(|t| t == topic) {
                removed.push(state.topics.remove(pos));
            }
        }
        if let Some(outbound) = connected_outbound(&state) {
            if !removed.is_empty() && !send_message(outbound, &Message::unsubscribe(&removed)) {
                WsMetrics::incr(&self.inner.metrics.send_errors);
            }
        }
    }

    // ── queries ─────────────────────────────────────────────────────────────

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().phase
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Whether an open is in flight.
    pub fn is_connecting(&self) -> bool {
        self.phase() == ConnectionPhase::Connecting
    }

    /// Subscribed topics in subscription order.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.state.lock().topics.clone()
    }

    /// Messages waiting for the next open.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Copy of the connection state.
    pub fn state(&self) -> ConnectionSnapshot {
        let state = self.inner.state.lock();
        ConnectionSnapshot {
            phase: state.phase,
            should_reconnect: state.should_reconnect,
            reconnect_attempts: state.reconnect_attempts,
            subscribed_topics: state.topics.clone(),
            queued_messages: state.queue.len(),
            url: state.url.clone(),
        }
    }

    /// Copy of the counters.
    pub fn metrics(&self) -> WsMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The bus this client publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn connected_outbound(state: &ConnState) -> Option<&mpsc::UnboundedSender<Outbound>> {
    match state.phase {
        ConnectionPhase::Connected => state.outbound.as_ref(),
        _ => None,
    }
}

fn send_message(outbound: &mpsc::UnboundedSender<Outbound>, message: &Message) -> bool {
    serde_json::to_string(message)
        .ok()
        .is_some_and(|text| outbound.send(Outbound::Frame(WireFrame::Text(text))).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use relay_bus::ListenerOptions;
    use relay_core::logging::capture_logs;
    use tokio::time::Instant;

    const URL: &str = "ws://relay.test/ws";

    // ── in-memory transport ─────────────────────────────────────────────

    #[derive(Clone, Copy, Debug)]
    enum Plan {
        Accept,
        Refuse,
        Hang,
    }

    /// The server end of one accepted in-memory connection.
    struct ServerEnd {
        received: fmpsc::UnboundedReceiver<WireFrame>,
        push: fmpsc::UnboundedSender<Result<WireFrame, TransportError>>,
    }

    impl ServerEnd {
        async fn next_frame(&mut self) -> WireFrame {
            self.received.next().await.expect("client closed the transport")
        }

        async fn next_json(&mut self) -> Value {
            loop {
                if let WireFrame::Text(text) = self.next_frame().await {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        fn push_text(&self, value: &Value) {
            self.push
                .unbounded_send(Ok(WireFrame::Text(value.to_string())))
                .unwrap();
        }

        fn push_raw(&self, text: &str) {
            self.push.unbounded_send(Ok(WireFrame::Text(text.into()))).unwrap();
        }

        fn close(&self, code: u16, reason: &str) {
            self.push
                .unbounded_send(Ok(WireFrame::Close { code, reason: reason.into() }))
                .unwrap();
        }
    }

    struct MemoryConnector {
        plans: Mutex<VecDeque<Plan>>,
        attempts: Mutex<Vec<(String, Instant)>>,
        accepted: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MemoryConnector {
        fn attempt_count(&self) -> usize {
            self.attempts.lock().len()
        }

        fn attempt_gaps_ms(&self) -> Vec<u128> {
            let attempts = self.attempts.lock();
            attempts
                .windows(2)
                .map(|w| (w[1].1 - w[0].1).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
            self.attempts.lock().push((url.to_owned(), Instant::now()));
            let plan = self.plans.lock().pop_front().unwrap_or(Plan::Refuse);
            match plan {
                Plan::Accept => {
                    let (to_server, received) = fmpsc::unbounded::<WireFrame>();
                    let (push, from_server) = fmpsc::unbounded();
                    let _ = self.accepted.send(ServerEnd { received, push });
                    Ok((
                        Box::pin(to_server.sink_map_err(TransportError::new)),
                        Box::pin(from_server),
                    ))
                }
                Plan::Refuse => Err(TransportError::new("connection refused")),
                Plan::Hang => futures::future::pending().await,
            }
        }
    }

    struct Fixture {
        client: WebSocketClient,
        bus: EventBus,
        connector: Arc<MemoryConnector>,
        servers: mpsc::UnboundedReceiver<ServerEnd>,
    }

    impl Fixture {
        async fn accepted(&mut self) -> ServerEnd {
            self.servers.recv().await.expect("connector dropped")
        }
    }

    fn settings() -> WsSettings {
        WsSettings {
            url: Some(URL.into()),
            ..WsSettings::default()
        }
    }

    fn fixture(plans: &[Plan], settings: WsSettings) -> Fixture {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(MemoryConnector {
            plans: Mutex::new(plans.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            accepted,
        });
        let bus = EventBus::new();
        let client = WebSocketClient::with_connector(bus.clone(), settings, connector.clone());
        Fixture {
            client,
            bus,
            connector,
            servers,
        }
    }

    fn record(bus: &EventBus, event_type: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = bus.on(
            event_type,
            move |e| {
                sink.lock().push(e.data.clone());
                Ok(())
            },
            ListenerOptions::default(),
        );
        seen
    }

    fn long() -> Option<Duration> {
        Some(Duration::from_secs(600))
    }

    // ── connect ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_subscribes_defaults_and_announces() {
        let mut fx = fixture(&[Plan::Accept], settings());
        let connected = record(&fx.bus, events::WEBSOCKET_CONNECTED);

        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;

        assert!(fx.client.is_connected());
        assert_eq!(
            server.next_json().await,
            json!({"type": "subscribe", "payload": {"topics": ["executions", "system"]}})
        );
        assert_eq!(
            connected.lock()[0],
            json!({"url": URL, "reconnected": false})
        );
    }

    #[tokio::test]
    async fn connect_is_noop_while_connected() {
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let _server = fx.accepted().await;
        fx.client.connect(None).await.unwrap();
        assert_eq!(fx.connector.attempt_count(), 1);
    }

    #[tokio::test]
    async fn url_is_derived_from_origin() {
        let settings = WsSettings {
            origin: "https://dash.example:8443/app".into(),
            ..WsSettings::default()
        };
        let mut fx = fixture(&[Plan::Accept], settings);
        fx.client.connect(None).await.unwrap();
        let _server = fx.accepted().await;
        assert_eq!(fx.connector.attempts.lock()[0].0, "wss://dash.example:8443/ws");
        assert_eq!(fx.client.state().url.as_deref(), Some("wss://dash.example:8443/ws"));
    }

    #[tokio::test]
    async fn invalid_url_fails_without_attempt() {
        let fx = fixture(&[], settings());
        let err = fx.client.connect(Some("http://nope")).await.unwrap_err();
        assert_matches!(err, WsError::InvalidUrl { .. });
        assert_eq!(fx.connector.attempt_count(), 0);
        assert_eq!(fx.client.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_errors_and_schedules_retry() {
        let fx = fixture(&[Plan::Refuse], settings());
        let errors = record(&fx.bus, events::WEBSOCKET_ERROR);

        let err = fx.client.connect(None).await.unwrap_err();
        assert_matches!(err, WsError::Connect { .. });
        assert_eq!(fx.client.phase(), ConnectionPhase::Disconnected);
        assert_eq!(errors.lock()[0]["kind"], "connect");

        let metrics = fx.client.metrics();
        assert_eq!(metrics.connection_errors, 1);
        assert_eq!(metrics.reconnect_attempts, 1);
        assert_eq!(metrics.last_reconnect_delay_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out_after_five_seconds() {
        let fx = fixture(&[Plan::Hang], settings());
        let started = Instant::now();
        let err = fx.client.connect(None).await.unwrap_err();
        assert_matches!(err, WsError::ConnectTimeout { timeout_ms: 5000, .. });
        assert_eq!(started.elapsed().as_millis(), 5000);
        assert_eq!(fx.client.state().reconnect_attempts, 1);
    }

    // ── offline queue ───────────────────────────────────────────────────

    #[tokio::test]
    async fn offline_sends_are_flushed_in_order_after_subscribe() {
        let mut fx = fixture(&[Plan::Accept], settings());
        for n in 0..3 {
            assert!(!fx.client.send(&Message::new("run_suite", json!({ "n": n }))));
        }
        assert_eq!(fx.client.queued_len(), 3);

        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        assert_eq!(server.next_json().await["type"], "subscribe");
        for n in 0..3 {
            let msg = server.next_json().await;
            assert_eq!(msg, json!({"type": "run_suite", "payload": { "n": n }}));
        }
        assert_eq!(fx.client.queued_len(), 0);

        assert!(fx.client.send(&Message::new("live", Value::Null)));
        assert_eq!(server.next_json().await["type"], "live");
        assert_eq!(fx.client.metrics().messages_sent, 5);
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let mut fx = fixture(&[Plan::Accept], settings());
        for n in 0..105 {
            let _ = fx.client.send(&Message::new("m", json!(n)));
        }
        assert_eq!(fx.client.queued_len(), 100);
        assert_eq!(fx.client.metrics().messages_dropped, 5);

        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        let _subscribe = server.next_json().await;
        assert_eq!(server.next_json().await["payload"], 5);
    }

    /// Accepts every open with a peer close already waiting on the stream.
    struct ClosingConnector;

    #[async_trait]
    impl Connector for ClosingConnector {
        async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
            let sink = futures::sink::drain::<WireFrame>()
                .sink_map_err(|never: std::convert::Infallible| -> TransportError { match never {} });
            let stream = futures::stream::iter([Ok(WireFrame::Close {
                code: 1011,
                reason: "overloaded".into(),
            })])
            .chain(futures::stream::pending());
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connected_precedes_an_immediate_close() {
        for _ in 0..100 {
            let bus = EventBus::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
            for event_type in [events::WEBSOCKET_CONNECTED, events::WEBSOCKET_DISCONNECTED] {
                let order = Arc::clone(&order);
                let closed_tx = closed_tx.clone();
                let _ = bus.on(
                    event_type,
                    move |e| {
                        order.lock().push(e.event_type.clone());
                        if e.event_type == events::WEBSOCKET_DISCONNECTED {
                            let _ = closed_tx.send(());
                        }
                        Ok(())
                    },
                    ListenerOptions::default(),
                );
            }

            let client =
                WebSocketClient::with_connector(bus, settings(), Arc::new(ClosingConnector));
            client.connect(None).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
                .await
                .unwrap()
                .unwrap();
            client.disconnect();

            let order = order.lock();
            assert_eq!(order[0], events::WEBSOCKET_CONNECTED);
            assert_eq!(order[1], events::WEBSOCKET_DISCONNECTED);
        }
    }

    // ── topics ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn offline_topics_join_the_resubscribe() {
        let mut fx = fixture(&[Plan::Accept], settings());
        fx.client.subscribe(&["coverage", "system"]);
        assert_eq!(fx.client.subscribed_topics(), vec!["executions", "system", "coverage"]);

        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        assert_eq!(
            server.next_json().await["payload"]["topics"],
            json!(["executions", "system", "coverage"])
        );
    }

    #[tokio::test]
    async fn live_subscription_changes_are_sent() {
        let mut fx = fixture(&[Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        let _initial = server.next_json().await;

        fx.client.subscribe(&["vault"]);
        assert_eq!(
            server.next_json().await,
            json!({"type": "subscribe", "payload": {"topics": ["vault"]}})
        );
        fx.client.unsubscribe(&["executions", "unknown"]);
        assert_eq!(
            server.next_json().await,
            json!({"type": "unsubscribe", "payload": {"topics": ["executions"]}})
        );
        assert_eq!(fx.client.subscribed_topics(), vec!["system", "vault"]);
    }

    // ── inbound ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn inbound_messages_are_routed() {
        let mut fx = fixture(&[Plan::Accept], settings());
        let raw = record(&fx.bus, events::WEBSOCKET_MESSAGE);
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        server.push_text(&json!({"type": "pong"}));
        server.push_text(&json!({"type": "mystery", "payload": 1}));
        server.push_text(&json!({"type": "execution_update", "payload": {"id": 9, "status": "running"}}));

        let payload = fx.bus.wait_for(events::EXECUTION_UPDATED, long()).await.unwrap();
        assert_eq!(payload, json!({"id": 9, "status": "running"}));

        let raw = raw.lock();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0], json!({"type": "pong"}));
        assert_eq!(raw[1]["type"], "mystery");
        assert_eq!(raw[2]["payload"]["id"], 9);
        assert_eq!(fx.client.metrics().messages_received, 3);
    }

    #[tokio::test]
    async fn every_server_push_type_has_an_event() {
        let mut fx = fixture(&[Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        for (kind, event) in [
            ("test_completion", events::TEST_COMPLETED),
            ("system_status", events::SYSTEM_STATUS),
            ("vault_update", events::VAULT_UPDATED),
            ("coverage_update", events::COVERAGE_UPDATED),
        ] {
            server.push_text(&json!({"type": kind, "payload": {"kind": kind}}));
            let payload = fx.bus.wait_for(event, long()).await.unwrap();
            assert_eq!(payload["kind"], kind);
        }
    }

    #[tokio::test]
    async fn garbage_is_counted_and_reported() {
        let mut fx = fixture(&[Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        server.push_raw("{not json");
        let error = fx.bus.wait_for(events::WEBSOCKET_ERROR, long()).await.unwrap();
        assert_eq!(error["kind"], "parse");

        server.push_raw(r#"{"payload": 1}"#);
        let _ = fx.bus.wait_for(events::WEBSOCKET_ERROR, long()).await.unwrap();
        assert_eq!(fx.client.metrics().parse_errors, 2);
        assert!(fx.client.is_connected());
    }

    // ── close and reconnect ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let mut fx = fixture(
            &[Plan::Accept, Plan::Refuse, Plan::Refuse, Plan::Refuse, Plan::Accept],
            settings(),
        );
        let connected = record(&fx.bus, events::WEBSOCKET_CONNECTED);
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        server.close(1011, "server restart");
        let closed = fx.bus.wait_for(events::WEBSOCKET_DISCONNECTED, long()).await.unwrap();
        assert_eq!(closed, json!({"code": 1011, "reason": "server restart"}));

        let _reopened = fx.accepted().await;
        assert_eq!(fx.connector.attempt_gaps_ms(), vec![1000, 2000, 4000, 8000]);
        assert_eq!(fx.client.state().reconnect_attempts, 0);
        assert_eq!(connected.lock()[1]["reconnected"], true);
        assert_eq!(fx.client.metrics().last_reconnect_delay_ms, 8000);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_transport_reconnects() {
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings());
        let errors = record(&fx.bus, events::WEBSOCKET_ERROR);
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        drop(server);
        let closed = fx.bus.wait_for(events::WEBSOCKET_DISCONNECTED, long()).await.unwrap();
        assert_eq!(closed["code"], 1006);
        assert_eq!(errors.lock()[0]["kind"], "transport");

        let _again = fx.accepted().await;
        assert!(fx.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_from_server_is_not_retried() {
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        server.close(1000, "bye");
        let _ = fx.bus.wait_for(events::WEBSOCKET_DISCONNECTED, long()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(fx.connector.attempt_count(), 1);
        assert_eq!(fx.client.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (logs, _guard) = capture_logs();
        let mut settings = settings();
        settings.reconnect.max_attempts = 2;
        let mut fx = fixture(&[Plan::Accept], settings);
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        drop(server);
        let failed = fx
            .bus
            .wait_for(events::WEBSOCKET_RECONNECT_FAILED, long())
            .await
            .unwrap();
        assert_eq!(failed, json!({"attempts": 2}));
        assert_eq!(fx.connector.attempt_count(), 3);
        assert!(logs.has_event(tracing::Level::ERROR, "giving up"));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fx.connector.attempt_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rearms_after_exhaustion() {
        let mut settings = settings();
        settings.reconnect.max_attempts = 1;
        let mut fx = fixture(&[Plan::Refuse, Plan::Refuse, Plan::Accept], settings);

        assert!(fx.client.connect(None).await.is_err());
        let _ = fx
            .bus
            .wait_for(events::WEBSOCKET_RECONNECT_FAILED, long())
            .await
            .unwrap();

        fx.client.connect(None).await.unwrap();
        let _server = fx.accepted().await;
        assert!(fx.client.is_connected());
        assert_eq!(fx.client.state().reconnect_attempts, 0);
    }

    // ── heartbeat ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn silent_server_is_dropped_and_reconnected() {
        let mut settings = settings();
        settings.heartbeat_timeout_ms = 1000;
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings);
        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        let _subscribe = server.next_json().await;

        assert_eq!(server.next_json().await["type"], "ping");
        assert_eq!(
            server.next_frame().await,
            WireFrame::Close { code: 4000, reason: "heartbeat timeout".into() }
        );

        let connected = fx.bus.wait_for(events::WEBSOCKET_CONNECTED, long()).await.unwrap();
        assert_eq!(connected["reconnected"], true);
        assert_eq!(fx.client.metrics().heartbeat_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chatty_server_stays_connected() {
        let mut settings = settings();
        settings.heartbeat_timeout_ms = 1000;
        let mut fx = fixture(&[Plan::Accept], settings);
        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        let _subscribe = server.next_json().await;

        for _ in 0..5 {
            let ping = server.next_json().await;
            assert_eq!(ping["type"], "ping");
            server.push_text(&json!({"type": "pong"}));
        }
        assert!(fx.client.is_connected());
        assert_eq!(fx.client.metrics().heartbeat_timeouts, 0);
    }

    // ── disconnect ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_normally_once() {
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings());
        let closed = record(&fx.bus, events::WEBSOCKET_DISCONNECTED);
        fx.client.connect(None).await.unwrap();
        let mut server = fx.accepted().await;
        let _subscribe = server.next_json().await;

        fx.client.disconnect();
        assert_eq!(fx.client.phase(), ConnectionPhase::Terminated);
        assert_eq!(
            server.next_frame().await,
            WireFrame::Close { code: 1000, reason: CLIENT_DISCONNECT_REASON.into() }
        );

        fx.client.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(closed.lock().len(), 1);
        assert_eq!(closed.lock()[0]["code"], 1000);
        assert_eq!(fx.connector.attempt_count(), 1);
        assert!(!fx.client.state().should_reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let mut fx = fixture(&[Plan::Accept, Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let server = fx.accepted().await;

        drop(server);
        let _ = fx.bus.wait_for(events::WEBSOCKET_DISCONNECTED, long()).await.unwrap();
        fx.client.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.connector.attempt_count(), 1);
        assert_eq!(fx.client.phase(), ConnectionPhase::Terminated);
    }

    #[tokio::test]
    async fn sends_after_disconnect_are_queued() {
        let mut fx = fixture(&[Plan::Accept], settings());
        fx.client.connect(None).await.unwrap();
        let _server = fx.accepted().await;
        fx.client.disconnect();
        assert!(!fx.client.send(&Message::new("late", Value::Null)));
        assert_eq!(fx.client.queued_len(), 1);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_silent() {
        let fx = fixture(&[], settings());
        let closed = record(&fx.bus, events::WEBSOCKET_DISCONNECTED);
        fx.client.disconnect();
        assert!(closed.lock().is_empty());
        assert_eq!(fx.client.phase(), ConnectionPhase::Terminated);
    }
}
