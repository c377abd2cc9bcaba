//! Heartbeat monitor: periodic `ping` envelopes on a live connection, with
//! an optional pong deadline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// When set, a ping not answered by a `pong` within this window marks the
    /// socket dead.  `None` leaves dead-socket detection to the server.
    pub pong_timeout: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: None,
        }
    }
}

/// Schedules pings for one connection at a time.
///
/// `start` and `stop` are idempotent: a second `start` while running is
/// refused, and `stop` on an idle monitor does nothing.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    task: Option<JoinHandle<()>>,
    last_pong: Arc<Mutex<Option<Instant>>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            task: None,
            last_pong: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start pinging.  `send_ping` returns `false` once the socket is gone,
    /// which ends the loop quietly.  `on_timeout` runs at most once, when a
    /// pong deadline is missed.
    ///
    /// Returns `false` (and does nothing) if already running.
    pub fn start<S, T>(&mut self, send_ping: S, on_timeout: T) -> bool
    where
        S: Fn() -> bool + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        if self.is_running() {
            tracing::warn!("heartbeat already running, ignoring start");
            return false;
        }

        *self.last_pong.lock() = None;
        let period = self.config.ping_interval;
        let pong_timeout = self.config.pong_timeout;
        let last_pong = self.last_pong.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sent_at = Instant::now();
                if !send_ping() {
                    tracing::debug!("heartbeat stopping, socket gone");
                    break;
                }
                tracing::trace!("ping sent");

                let Some(timeout) = pong_timeout else {
                    continue;
                };
                tokio::time::sleep(timeout).await;
                let answered = last_pong.lock().is_some_and(|t| t >= sent_at);
                if !answered {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "no pong within deadline"
                    );
                    on_timeout();
                    break;
                }
            }
        }));
        true
    }

    /// Stop pinging.  Returns `true` if a running loop was stopped.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Note an inbound `pong`.
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Some(Instant::now());
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
