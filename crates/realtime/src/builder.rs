//! Builder pattern for constructing a [`ConnectionConfig`].

use std::time::Duration;

use pl_protocol::DEFAULT_MAX_INBOUND_BYTES;

use crate::heartbeat::HeartbeatConfig;
use crate::reconnect::ReconnectPolicy;
use crate::types::RealtimeError;

/// Everything a [`Connection`](crate::Connection) needs, fixed at
/// construction.  The target address is never renegotiated mid-connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub(crate) url: String,
    pub(crate) token: Option<String>,
    pub(crate) default_room: Option<String>,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) heartbeat: HeartbeatConfig,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_inbound_bytes: usize,
}

impl ConnectionConfig {
    /// Start a new builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn default_room(&self) -> Option<&str> {
        self.default_room.as_deref()
    }

    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_inbound_bytes(&self) -> usize {
        self.max_inbound_bytes
    }

    /// Copy of this config carrying `token` instead.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.url.is_empty() {
            return Err(RealtimeError::Config("url is required".into()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(RealtimeError::Config(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        let policy = &self.reconnect;
        if policy.base_delay.is_zero() {
            return Err(RealtimeError::Config("base_delay must be positive".into()));
        }
        if policy.max_delay < policy.base_delay {
            return Err(RealtimeError::Config(
                "max_delay must be at least base_delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&policy.jitter_ratio) {
            return Err(RealtimeError::Config(format!(
                "jitter_ratio must be within [0, 1], got {}",
                policy.jitter_ratio
            )));
        }
        if self.heartbeat.ping_interval.is_zero() {
            return Err(RealtimeError::Config("ping_interval must be positive".into()));
        }
        if self.heartbeat.pong_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RealtimeError::Config("pong_timeout must be positive".into()));
        }
        if self.max_inbound_bytes == 0 {
            return Err(RealtimeError::Config("max_inbound_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Full connection URL with credential and default room as
    /// percent-encoded query params.
    pub fn build_url(&self) -> String {
        let mut params = Vec::new();
        if let Some(token) = &self.token {
            params.push(format!("token={}", urlencoding::encode(token)));
        }
        if let Some(room) = &self.default_room {
            params.push(format!("room={}", urlencoding::encode(room)));
        }
        if params.is_empty() {
            return self.url.clone();
        }

        let sep = if self.url.contains('?') { "&" } else { "?" };
        format!("{}{sep}{}", self.url, params.join("&"))
    }
}

/// Fluent builder for [`ConnectionConfig`].
///
/// # Example
///
/// ```rust,no_run
/// # use pl_realtime::ConnectionConfigBuilder;
/// let config = ConnectionConfigBuilder::new()
///     .url("ws://localhost:8000/ws")
///     .token("secret")
///     .default_room("pipeline-42")
///     .ping_interval(std::time::Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    url: String,
    token: Option<String>,
    default_room: Option<String>,
    reconnect: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    connect_timeout: Duration,
    max_inbound_bytes: usize,
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self {
            url: String::new(),
            token: None,
            default_room: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
            max_inbound_bytes: DEFAULT_MAX_INBOUND_BYTES,
        }
    }

    // ── Target ───────────────────────────────────────────────────────

    /// Set the WebSocket URL (e.g. `wss://api.example.com/ws`).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the bearer credential sent as the `token` query param.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Room requested through the `room` query param at connect time.
    pub fn default_room(mut self, room: impl Into<String>) -> Self {
        self.default_room = Some(room.into());
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the reconnect policy.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Consecutive failures tolerated before giving up (`0` = unlimited).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.reconnect.max_attempts = n;
        self
    }

    /// Override the heartbeat config.
    pub fn heartbeat(mut self, cfg: HeartbeatConfig) -> Self {
        self.heartbeat = cfg;
        self
    }

    /// Override the ping interval (default 30s).
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.heartbeat.ping_interval = d;
        self
    }

    /// Treat a ping unanswered for `d` as a dead socket.
    pub fn pong_timeout(mut self, d: Duration) -> Self {
        self.heartbeat.pong_timeout = Some(d);
        self
    }

    /// Bound on a single socket open (default 10s).
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    // ── Wire limits ──────────────────────────────────────────────────

    /// Inbound frames larger than this are dropped (default 1 MiB).
    pub fn max_inbound_bytes(mut self, n: usize) -> Self {
        self.max_inbound_bytes = n;
        self
    }

    /// Build and validate the [`ConnectionConfig`].
    pub fn build(self) -> Result<ConnectionConfig, RealtimeError> {
        let config = ConnectionConfig {
            url: self.url,
            token: self.token,
            default_room: self.default_room,
            reconnect: self.reconnect,
            heartbeat: self.heartbeat,
            connect_timeout: self.connect_timeout,
            max_inbound_bytes: self.max_inbound_bytes,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
