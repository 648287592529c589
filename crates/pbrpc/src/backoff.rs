//! Capped exponential reconnect delay.

use std::time::{Duration, Instant};

/// Delay before the first reconnect attempt
pub const INITIAL_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Reconnect state of one connection.
///
/// After the n-th consecutive failure the next attempt is allowed no earlier
/// than `min(2^(n-1) * initial, max)` later. A successful connect starts over.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    interval: Duration,
    failures: u32,
    next_attempt_at: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> ReconnectBackoff {
        let initial = initial.min(max);
        ReconnectBackoff {
            initial,
            max,
            interval: initial,
            failures: 0,
            next_attempt_at: None,
        }
    }

    /// Record a failure at `now` and return the delay until the next attempt.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.interval;
        self.failures = self.failures.saturating_add(1);
        self.next_attempt_at = Some(now + delay);
        self.interval = (self.interval * 2).min(self.max);
        delay
    }

    pub fn succeeded(&mut self) {
        self.interval = self.initial;
        self.failures = 0;
        self.next_attempt_at = None;
    }

    /// Whether a connect may be started at `now`.
    pub fn may_attempt(&self, now: Instant) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Consume the waiting period before a new attempt.
    pub fn attempt(&mut self) {
        self.next_attempt_at = None;
    }

    /// Consecutive failures since the last successful connect
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new(INITIAL_RECONNECT_INTERVAL, Duration::from_secs(32))
    }
}
