//! Reconnect policy (capped exponential back-off) and the single-slot timer
//! a connection uses to schedule its next attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

/// Controls how a connection retries after losing its socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied after doubling.
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up.  `0` means unlimited.
    pub max_attempts: u32,
    /// Fraction of the capped delay that jitter may subtract, in `[0, 1]`.
    /// `0.0` disables jitter.
    pub jitter_ratio: f64,
    /// Jitter never pushes a delay below this floor.
    pub min_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter_ratio: 0.0,
            min_delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^(attempt-1), max)`.  Attempt numbering starts at 1 for
    /// the first retry; `0` is treated as `1`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Delay for `attempt`, with jitter applied when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_for(attempt);
        if self.jitter_ratio <= 0.0 {
            return capped;
        }
        let fraction: f64 = rand::thread_rng().gen();
        self.jittered(capped, fraction)
    }

    fn jittered(&self, capped: Duration, fraction: f64) -> Duration {
        let ratio = self.jitter_ratio.min(1.0);
        let capped_ms = capped.as_millis() as f64;
        let reduced = Duration::from_millis((capped_ms - capped_ms * ratio * fraction) as u64);
        reduced.max(self.min_delay.min(capped))
    }

    /// Whether `attempts` consecutive failures exhaust the policy.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// A retry that has been armed but has not fired yet.
#[derive(Debug)]
pub struct PendingReconnect {
    pub attempt: u32,
    pub delay: Duration,
    seq: u64,
    handle: JoinHandle<()>,
}

/// Owns at most one pending reconnect timer.
///
/// Arming while a timer is pending cancels the old one first; timers are
/// replaced, never stacked.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    pending: Option<PendingReconnect>,
    next_seq: u64,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that runs `on_fire(seq)` after `delay`.  The callback must
    /// call [`claim`](Self::claim) with `seq` before acting.
    pub fn arm<F, Fut>(&mut self, attempt: u32, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(prev) = self.pending.take() {
            tracing::warn!(
                attempt = prev.attempt,
                "reconnect timer already pending, cancelling it before rescheduling"
            );
            prev.handle.abort();
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(seq).await;
        });
        self.pending = Some(PendingReconnect {
            attempt,
            delay,
            seq,
            handle,
        });
    }

    /// Consume the pending timer if `seq` identifies it.  Returns `None` for a
    /// timer that was cancelled or replaced after it woke up.
    pub fn claim(&mut self, seq: u64) -> Option<PendingReconnect> {
        match &self.pending {
            Some(p) if p.seq == seq => self.pending.take(),
            _ => None,
        }
    }

    /// Cancel the pending timer, if any.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingReconnect> {
        self.pending.as_ref()
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
