//! Reconnection back-off: `base * 2^attempts`, bounded by a maximum number
//! of attempts.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    /// Reconnect attempts made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    ///
    /// Does not consume an attempt; call [`Backoff::record_attempt`] when
    /// the attempt actually starts.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
