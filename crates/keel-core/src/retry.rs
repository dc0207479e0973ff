use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter and a bounded attempt count.
///
/// The delay for attempt `n` (1-based) is `base * 2^(n-1)` plus up to 25%
/// jitter, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_attempts: 5,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff);
        let jitter_cap = backoff.as_millis() as u64 / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        (backoff + Duration::from_millis(jitter)).min(self.max_backoff)
    }

    /// Whether the given attempt (1-based) exceeds the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
