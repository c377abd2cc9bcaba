//! A single realtime connection: one socket at a time, its lifecycle state
//! machine, heartbeat, room replay and reconnect scheduling.
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──open──▶ Connected
//!                        │  ▲                  │
//!                  fail  │  │ retry timer      │ close / error / pong timeout
//!                        ▼  │                  ▼
//!                      Disconnected ◀──────────┘
//!                        │ (retries exhausted: stays here, reconnect_failed)
//!
//! any state ──disconnect()──▶ Disconnecting ──▶ Closed
//! ```
//!
//! State lives behind a single mutex and every transition happens inside
//! one critical section, so timer callbacks and socket tasks observe the
//! same ordering a single event loop would.  A `generation` counter ties each
//! socket, heartbeat and timer to the open attempt that created it; stale
//! callbacks from an older generation are ignored.

use std::sync::{Arc, Weak};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pl_protocol::{
    ControlMessage, Envelope, ProtocolError, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::builder::ConnectionConfig;
use crate::dispatcher::{Dispatcher, Handler, HandlerId};
use crate::heartbeat::HeartbeatMonitor;
use crate::reconnect::ReconnectTimer;
use crate::rooms::RoomMembership;
use crate::types::{ConnectionEvent, ConnectionState, RealtimeError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a realtime connection.
///
/// Cheap to clone; all clones drive the same socket.  Background tasks hold
/// only weak references, so the connection is torn down once the last handle
/// (typically the [`ConnectionRegistry`](crate::ConnectionRegistry) entry)
/// is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    key: String,
    config: ConnectionConfig,
    dispatcher: Dispatcher,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Highest generation whose open attempt has finished (opened, failed
    /// or superseded by `disconnect`).
    settled: watch::Sender<u64>,
}

struct Shared {
    state: ConnectionState,
    attempt: u32,
    should_reconnect: bool,
    generation: u64,
    socket: Option<Socket>,
    reconnect: ReconnectTimer,
    heartbeat: HeartbeatMonitor,
    rooms: RoomMembership,
    connection_id: Option<String>,
}

/// Live socket plumbing.  Dropping it stops the reader; the writer exits
/// once every outbound sender is gone.
struct Socket {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum ConnectStep {
    Open(u64),
    Await(watch::Receiver<u64>, u64),
    Skip,
}

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

impl Connection {
    /// Create an idle connection.  Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(key: impl Into<String>, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (settled, _) = watch::channel(0);
        let heartbeat = HeartbeatMonitor::new(config.heartbeat.clone());
        Self {
            inner: Arc::new(Inner {
                key: key.into(),
                config,
                dispatcher: Dispatcher::new(),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Idle,
                    attempt: 0,
                    should_reconnect: true,
                    generation: 0,
                    socket: None,
                    reconnect: ReconnectTimer::new(),
                    heartbeat,
                    rooms: RoomMembership::new(),
                    connection_id: None,
                }),
                events,
                settled,
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the socket.  Resolves once it has opened or failed; failures
    /// are reported on the event stream and feed the reconnect policy.
    ///
    /// While another open is in flight (a concurrent `connect` or a retry)
    /// this waits for that attempt's outcome instead of starting a second
    /// one.  No-op while `Connected`, and on a `Closed` connection (see
    /// [`reset`](Self::reset)).  A manual connect from `Disconnected`
    /// supersedes any pending retry and starts a fresh attempt count.
    pub async fn connect(&self) {
        let step = {
            let mut s = self.inner.shared.lock();
            let state = s.state;
            match state {
                ConnectionState::Connecting => {
                    ConnectStep::Await(self.inner.settled.subscribe(), s.generation)
                }
                ConnectionState::Connected | ConnectionState::Disconnecting => {
                    tracing::debug!(key = %self.inner.key, state = %state, "connect ignored");
                    ConnectStep::Skip
                }
                ConnectionState::Closed => {
                    tracing::warn!(
                        key = %self.inner.key,
                        "connect on a closed connection ignored, call reset() first"
                    );
                    ConnectStep::Skip
                }
                ConnectionState::Idle | ConnectionState::Disconnected => {
                    s.reconnect.cancel();
                    s.attempt = 0;
                    s.state = ConnectionState::Connecting;
                    s.generation += 1;
                    ConnectStep::Open(s.generation)
                }
            }
        };

        match step {
            ConnectStep::Open(generation) => self.inner.open(generation).await,
            ConnectStep::Await(mut settled, generation) => {
                tracing::debug!(key = %self.inner.key, "open already in flight, waiting for it");
                // The sender lives as long as `self`, so this only returns once settled.
                let _ = settled.wait_for(|done| *done >= generation).await;
            }
            ConnectStep::Skip => {}
        }
    }

    /// Close for good.  Cancels any pending retry and the heartbeat before
    /// returning, then sends a normal-closure frame.  Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut s = self.inner.shared.lock();
        s.should_reconnect = false;
        s.reconnect.cancel();
        s.heartbeat.stop();

        let previous = s.state;
        if previous == ConnectionState::Closed {
            return;
        }
        s.state = ConnectionState::Disconnecting;
        s.generation += 1;
        self.inner.settle(s.generation);

        if let Some(socket) = s.socket.take() {
            let _ = socket.outbound.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "client disconnect".into(),
            });
        }
        s.rooms.clear_confirmations();
        s.connection_id = None;
        s.state = ConnectionState::Closed;

        tracing::info!(key = %self.inner.key, from = %previous, "connection closed by caller");
        if previous == ConnectionState::Connected {
            self.inner.emit(ConnectionEvent::Disconnected {
                code: Some(CLOSE_NORMAL),
                reason: "client disconnect".into(),
            });
        }
    }

    /// Bring a `Closed` connection back to `Idle` so it can connect again.
    /// Returns `false` in any other state.
    pub fn reset(&self) -> bool {
        let mut s = self.inner.shared.lock();
        if s.state != ConnectionState::Closed {
            return false;
        }
        s.state = ConnectionState::Idle;
        s.should_reconnect = true;
        s.attempt = 0;
        true
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Fire-and-forget send.  Dropped with a warning unless connected;
    /// nothing is queued.  Returns whether the envelope was handed to the
    /// socket writer.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let s = self.inner.shared.lock();
        match (&s.state, &s.socket) {
            (ConnectionState::Connected, Some(socket)) => send_envelope(&socket.outbound, envelope),
            _ => {
                tracing::warn!(
                    key = %self.inner.key,
                    state = %s.state,
                    kind = %envelope.kind,
                    "send while not connected, dropping"
                );
                false
            }
        }
    }

    /// Track `room` and join it now if connected; otherwise the join goes
    /// out with the replay after the next successful connect.
    pub fn join_room(&self, room: &str) {
        let mut s = self.inner.shared.lock();
        if !s.rooms.join(room) {
            return;
        }
        match (&s.state, &s.socket) {
            (ConnectionState::Connected, Some(socket)) => {
                send_envelope(&socket.outbound, &Envelope::join_room(room));
            }
            _ => tracing::debug!(key = %self.inner.key, room = %room, "join queued until connected"),
        }
    }

    /// Stop tracking `room`, sending `leave_room` if connected.
    pub fn leave_room(&self, room: &str) {
        let mut s = self.inner.shared.lock();
        if !s.rooms.leave(room) {
            return;
        }
        if let (ConnectionState::Connected, Some(socket)) = (&s.state, &s.socket) {
            send_envelope(&socket.outbound, &Envelope::leave_room(room));
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to envelopes whose `type` is `topic` (payload delivered), or
    /// to every envelope via the `"message"` topic (whole envelope delivered).
    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(topic, handler)
    }

    pub fn on_arc(&self, topic: impl Into<String>, handler: Handler) -> HandlerId {
        self.inner.dispatcher.on_arc(topic, handler)
    }

    pub fn off(&self, topic: &str, id: HandlerId) -> bool {
        self.inner.dispatcher.off(topic, id)
    }

    /// Lifecycle event stream (connected, disconnected, errors, retries).
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.inner.shared.lock().attempt
    }

    pub fn reconnect_pending(&self) -> bool {
        self.inner.shared.lock().reconnect.is_pending()
    }

    /// Server-assigned id from `connection_established`, for the current
    /// socket.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.shared.lock().connection_id.clone()
    }

    /// Tracked rooms in join order.
    pub fn rooms(&self) -> Vec<String> {
        self.inner.shared.lock().rooms.rooms().to_vec()
    }

    /// Whether the server acknowledged `room` on the current socket.
    pub fn is_room_confirmed(&self, room: &str) -> bool {
        self.inner.shared.lock().rooms.is_confirmed(room)
    }

    /// Whether two handles drive the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.inner.key)
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Release `connect` callers waiting on the open for `generation`.
    fn settle(&self, generation: u64) {
        self.settled.send_modify(|done| *done = (*done).max(generation));
    }

    /// One socket open for `generation`.
    async fn open(self: &Arc<Self>, generation: u64) {
        let timeout = self.config.connect_timeout;
        tracing::info!(key = %self.key, url = %self.config.url, "connecting");

        let url = self.config.build_url();
        let result = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(RealtimeError::from(e)),
            Err(_) => Err(RealtimeError::Timeout(timeout)),
        };

        match result {
            Ok(ws) => self.on_open(generation, ws),
            Err(e) => self.on_open_failed(generation, e),
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, mut ws: WsStream) {
        let mut s = self.shared.lock();
        if s.generation != generation || s.state != ConnectionState::Connecting {
            tracing::debug!(key = %self.key, "discarding socket opened after disconnect");
            tokio::spawn(async move {
                let _ = ws.close(None).await;
            });
            return;
        }

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));

        s.state = ConnectionState::Connected;
        s.attempt = 0;
        s.connection_id = None;
        s.rooms.clear_confirmations();
        self.settle(generation);

        let ping_tx = tx.clone();
        let weak = Arc::downgrade(self);
        s.heartbeat.start(
            move || send_envelope(&ping_tx, &Envelope::ping()),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_socket_closed(generation, Some(CLOSE_ABNORMAL), "pong timeout".into());
                }
            },
        );

        tracing::info!(key = %self.key, "connected");
        self.emit(ConnectionEvent::Connected {
            connection_key: self.key.clone(),
        });

        for join in s.rooms.replay() {
            send_envelope(&tx, &join);
        }

        let reader = tokio::spawn(read_loop(Arc::downgrade(self), generation, stream));
        s.socket = Some(Socket {
            outbound: tx,
            reader,
            writer,
        });
    }

    fn on_open_failed(self: &Arc<Self>, generation: u64, error: RealtimeError) {
        let mut s = self.shared.lock();
        if s.generation != generation || s.state != ConnectionState::Connecting {
            return;
        }
        s.state = ConnectionState::Disconnected;
        self.settle(generation);
        tracing::warn!(key = %self.key, attempt = s.attempt, error = %error, "connect failed");
        self.emit(ConnectionEvent::Error {
            message: error.to_string(),
        });
        self.schedule_reconnect(&mut s);
    }

    /// Socket lost while connected: by the peer, a transport error, or a
    /// missed pong.
    fn on_socket_closed(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let mut s = self.shared.lock();
        if s.generation != generation || s.state != ConnectionState::Connected {
            return;
        }
        s.heartbeat.stop();
        if let Some(socket) = s.socket.take() {
            socket.writer.abort();
        }
        s.rooms.clear_confirmations();
        s.connection_id = None;
        s.state = ConnectionState::Disconnected;

        tracing::warn!(key = %self.key, code = ?code, reason = %reason, "disconnected");
        self.emit(ConnectionEvent::Disconnected { code, reason });
        self.schedule_reconnect(&mut s);
    }

    fn schedule_reconnect(self: &Arc<Self>, s: &mut Shared) {
        if !s.should_reconnect {
            return;
        }
        let policy = &self.config.reconnect;
        if policy.should_give_up(s.attempt) {
            tracing::error!(key = %self.key, attempts = s.attempt, "max reconnect attempts exhausted");
            self.emit(ConnectionEvent::ReconnectFailed { attempts: s.attempt });
            return;
        }

        s.attempt += 1;
        let attempt = s.attempt;
        let delay = policy.delay(attempt);
        let weak = Arc::downgrade(self);
        s.reconnect.arm(attempt, delay, move |seq| async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_reconnect_timer(seq).await;
            }
        });

        tracing::info!(
            key = %self.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
    }

    async fn on_reconnect_timer(self: &Arc<Self>, seq: u64) {
        let generation = {
            let mut s = self.shared.lock();
            if s.reconnect.claim(seq).is_none() {
                return;
            }
            if !s.should_reconnect || s.state != ConnectionState::Disconnected {
                return;
            }
            s.state = ConnectionState::Connecting;
            s.generation += 1;
            tracing::info!(key = %self.key, attempt = s.attempt, "reconnecting");
            s.generation
        };
        self.open(generation).await;
    }

    /// Inbound frame: bookkeeping for control types, then fan-out.
    fn handle_frame(&self, parsed: Result<Envelope, ProtocolError>) {
        let envelope = match parsed {
            Ok(env) => env,
            Err(e) => {
                let error = RealtimeError::from(e);
                tracing::warn!(key = %self.key, error = %error, "dropping inbound frame");
                return;
            }
        };

        if let Some(control) = envelope.control() {
            let mut s = self.shared.lock();
            match control {
                ControlMessage::Pong { .. } => {
                    tracing::trace!(key = %self.key, "pong");
                    s.heartbeat.record_pong();
                }
                ControlMessage::ConnectionEstablished { connection_id } => {
                    tracing::debug!(key = %self.key, connection_id = %connection_id, "connection established");
                    s.connection_id = Some(connection_id);
                }
                ControlMessage::RoomJoined { room } => s.rooms.confirm(&room),
                ControlMessage::RoomLeft { room } => s.rooms.unconfirm(&room),
                ControlMessage::Error { message } => {
                    tracing::warn!(key = %self.key, message = %message, "server reported error");
                    self.emit(ConnectionEvent::ServerError { message });
                }
            }
        }

        self.dispatcher.dispatch(&envelope);
    }
}

fn send_envelope(tx: &mpsc::UnboundedSender<Outbound>, envelope: &Envelope) -> bool {
    match envelope.to_json() {
        Ok(json) => tx.send(Outbound::Text(json)).is_ok(),
        Err(e) => {
            tracing::error!(kind = %envelope.kind, error = %e, "failed to serialize outbound envelope");
            false
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(json) => {
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Weak<Inner>, generation: u64, mut stream: SplitStream<WsStream>) {
    let (code, reason) = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break (CLOSE_ABNORMAL, e.to_string()),
            None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
        };
        let Some(conn) = inner.upgrade() else {
            return;
        };
        let limit = conn.config.max_inbound_bytes;
        match msg {
            Message::Text(text) if text.len() > limit => conn.handle_frame(Err(
                ProtocolError::FrameTooLarge {
                    size: text.len(),
                    max: limit,
                },
            )),
            Message::Binary(bytes) if bytes.len() > limit => conn.handle_frame(Err(
                ProtocolError::FrameTooLarge {
                    size: bytes.len(),
                    max: limit,
                },
            )),
            Message::Text(text) => conn.handle_frame(Envelope::parse(&text)),
            Message::Binary(bytes) => conn.handle_frame(Envelope::parse_slice(&bytes)),
            Message::Close(frame) => {
                break match frame {
                    Some(f) => (u16::from(f.code), f.reason.to_string()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
            }
            _ => {}
        }
    };

    if let Some(conn) = inner.upgrade() {
        conn.on_socket_closed(generation, Some(code), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::builder::ConnectionConfigBuilder;

    /// Points at a port that was just released, so opens are refused.
    fn config() -> ConnectionConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ConnectionConfigBuilder::new()
            .url(format!("ws://127.0.0.1:{port}/ws"))
            .connect_timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    #[test]
    fn new_connection_is_idle() {
        let conn = Connection::new("p1", config());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.key(), "p1");
        assert_eq!(conn.attempt(), 0);
        assert!(!conn.is_connected());
        assert!(!conn.is_connecting());
        assert!(conn.connection_id().is_none());
    }

    #[test]
    fn send_while_idle_is_dropped() {
        let conn = Connection::new("p1", config());
        assert!(!conn.send(&Envelope::bare("hello")));
    }

    #[test]
    fn rooms_are_tracked_before_connect() {
        let conn = Connection::new("p1", config());
        conn.join_room("a");
        conn.join_room("b");
        conn.join_room("a");
        assert_eq!(conn.rooms(), vec!["a", "b"]);
        conn.leave_room("a");
        assert_eq!(conn.rooms(), vec!["b"]);
        assert!(!conn.is_room_confirmed("b"));
    }

    #[test]
    fn disconnect_is_idempotent_and_reset_reopens() {
        let conn = Connection::new("p1", config());
        assert!(!conn.reset());
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.reset());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn connect_after_disconnect_is_ignored() {
        let conn = Connection::new("p1", config());
        conn.disconnect();
        conn.connect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.reconnect_pending());
    }

    #[tokio::test]
    async fn failed_open_reports_error_and_schedules_retry() {
        let conn = Connection::new("p1", config());
        let mut events = conn.subscribe_events();

        conn.connect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.attempt(), 1);
        assert!(conn.reconnect_pending());

        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Error { .. })));
        match events.recv().await {
            Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(3));
            }
            other => panic!("expected ReconnectScheduled, got {other:?}"),
        }

        conn.disconnect();
        assert!(!conn.reconnect_pending());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn handlers_registered_through_connection() {
        let conn = Connection::new("p1", config());
        let id = conn.on("progress_update", |_| {});
        assert!(conn.off("progress_update", id));
        assert!(!conn.off("progress_update", id));
    }

    #[test]
    fn clones_share_identity() {
        let a = Connection::new("p1", config());
        let b = a.clone();
        let c = Connection::new("p1", config());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
