//! Bounded exponential backoff with jitter for transient I/O retries.

use std::time::Duration;

/// Retry schedule: base delay doubling per attempt, each delay
/// jittered to between half and the full exponential value, capped at
/// a fixed number of attempts. After the last attempt the caller gives
/// up on the operation (for checkpoint storage, that means abandoning
/// the checkpoint attempt).
#[derive(Debug)]
pub(crate) struct Backoff {
    attempt: u32,
    max_attempts: u32,
    base: Duration,
}

impl Backoff {
    pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub(crate) fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base,
        }
    }

    /// The next delay to sleep before retrying, or `None` when the
    /// attempts are exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1 << self.attempt.min(16));
        self.attempt += 1;
        let exp_ms = exp.as_millis() as u64;
        let jittered = exp_ms / 2 + fastrand::u64(0..=exp_ms.max(2) / 2);
        Some(Duration::from_millis(jittered.max(1)))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Self::DEFAULT_MAX_ATTEMPTS)
    }
}
