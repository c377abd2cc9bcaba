use std::time::Duration;

use pl_protocol::DEFAULT_MAX_INBOUND_BYTES;
use serde::{Deserialize, Serialize};

use crate::builder::{ConnectionConfig, ConnectionConfigBuilder};
use crate::heartbeat::HeartbeatConfig;
use crate::reconnect::ReconnectPolicy;
use crate::types::RealtimeError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Realtime transport settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-loadable transport tuning (a `[realtime]` TOML section or JSON).
///
/// Every field has a default so an empty section is valid.  The target URL
/// and credential are not part of it; they come from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    #[serde(default = "d_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,

    /// `0` retries forever.
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub jitter_ratio: f64,

    #[serde(default = "d_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "d_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// When `None`, pong deadlines are not enforced.
    #[serde(default)]
    pub pong_timeout_ms: Option<u64>,

    #[serde(default = "d_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "d_max_inbound_bytes")]
    pub max_inbound_bytes: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: d_base_delay_ms(),
            max_delay_ms: d_max_delay_ms(),
            max_attempts: d_max_attempts(),
            jitter_ratio: 0.0,
            min_delay_ms: d_min_delay_ms(),
            ping_interval_ms: d_ping_interval_ms(),
            pong_timeout_ms: None,
            connect_timeout_ms: d_connect_timeout_ms(),
            max_inbound_bytes: d_max_inbound_bytes(),
        }
    }
}

impl RealtimeSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            jitter_ratio: self.jitter_ratio,
            min_delay: Duration::from_millis(self.min_delay_ms),
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: self.pong_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Builder for `url` pre-loaded with these settings.
    pub fn builder(&self, url: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
            .url(url)
            .reconnect_policy(self.reconnect_policy())
            .heartbeat(self.heartbeat())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .max_inbound_bytes(self.max_inbound_bytes)
    }

    pub fn to_config(&self, url: impl Into<String>) -> Result<ConnectionConfig, RealtimeError> {
        self.builder(url).build()
    }
}

fn d_base_delay_ms() -> u64 {
    3_000
}

fn d_max_delay_ms() -> u64 {
    30_000
}

fn d_max_attempts() -> u32 {
    5
}

fn d_min_delay_ms() -> u64 {
    500
}

fn d_ping_interval_ms() -> u64 {
    30_000
}

fn d_connect_timeout_ms() -> u64 {
    10_000
}

fn d_max_inbound_bytes() -> usize {
    DEFAULT_MAX_INBOUND_BYTES
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_empty_uses_defaults() {
        let s: RealtimeSettings = toml::from_str("").unwrap();
        assert_eq!(s.base_delay_ms, 3_000);
        assert_eq!(s.max_delay_ms, 30_000);
        assert_eq!(s.max_attempts, 5);
        assert_eq!(s.ping_interval_ms, 30_000);
        assert!(s.pong_timeout_ms.is_none());
        assert_eq!(s.max_inbound_bytes, DEFAULT_MAX_INBOUND_BYTES);
    }

    #[test]
    fn deserialize_overrides() {
        let toml_str = r#"
            base_delay_ms = 100
            max_delay_ms = 1000
            max_attempts = 0
            jitter_ratio = 0.25
            pong_timeout_ms = 5000
        "#;
        let s: RealtimeSettings = toml::from_str(toml_str).unwrap();
        let policy = s.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(1000));
        assert!(!policy.should_give_up(100));
        assert!((policy.jitter_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(s.heartbeat().pong_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn to_config_validates() {
        let s = RealtimeSettings {
            max_delay_ms: 10,
            ..Default::default()
        };
        assert!(s.to_config("ws://localhost/ws").is_err());

        let cfg = RealtimeSettings::default().to_config("ws://localhost/ws").unwrap();
        assert_eq!(cfg.reconnect(), &ReconnectPolicy::default());
        assert_eq!(cfg.heartbeat(), &HeartbeatConfig::default());
    }

    #[test]
    fn json_roundtrip() {
        let s = RealtimeSettings {
            ping_interval_ms: 15_000,
            ..Default::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: RealtimeSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ping_interval_ms, 15_000);
        assert_eq!(back.connect_timeout_ms, 10_000);
    }
}
