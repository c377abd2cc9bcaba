//! Connection states, lifecycle events, and errors.

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed (or reset) and never asked to connect.
    Idle,
    /// Socket open in progress.
    Connecting,
    /// Socket open; heartbeat running.
    Connected,
    /// Caller-initiated shutdown in progress.
    Disconnecting,
    /// Socket lost.  A reconnect may be pending unless retries are exhausted.
    Disconnected,
    /// Terminal after an explicit `disconnect()`.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events published on a connection's lifecycle stream.
///
/// Runtime and network conditions never surface as `Err` to the caller;
/// they arrive here so the UI layer can decide how to present them.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket opened.  Room joins are replayed right after this event.
    Connected { connection_key: String },
    /// Socket closed or failed after being connected.
    Disconnected { code: Option<u16>, reason: String },
    /// Open failure or transport error.
    Error { message: String },
    /// A retry has been armed.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Retries exhausted; the connection stays disconnected.
    ReconnectFailed { attempts: u32 },
    /// The server sent an `error` envelope.
    ServerError { message: String },
}

/// Top-level client error.
///
/// Only [`RealtimeError::Config`] is ever returned to a caller directly; the
/// other variants describe transport failures and are rendered into
/// [`ConnectionEvent::Error`] messages.
#[derive(thiserror::Error, Debug)]
pub enum RealtimeError {
    #[error("config: {0}")]
    Config(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol: {0}")]
    Protocol(#[from] pl_protocol::ProtocolError),
}
