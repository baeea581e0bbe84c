//! Exponential back-off for task retries.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to every delay, including handler suggestions.
    pub max_delay: Duration,
    /// Budget for nodes that don't set `maxRetries`.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry_count, max)`, where `retry_count` is the number of
    /// retries already spent.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The computed delay, raised to the handler's suggestion when that is
    /// longer.  Still capped.
    pub fn delay_with_hint(&self, retry_count: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay(retry_count);
        match hint {
            Some(hint) if hint > computed => hint.min(self.max_delay),
            _ => computed,
        }
    }
}
