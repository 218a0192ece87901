use std::time::Duration;

/// Exponential backoff used when generating credentials fails.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Multiplier applied to the interval for every past failed attempt.
    backoff_coefficient: u32,
    /// Backoff after the first failure.
    initial_interval: Duration,
    /// Upper bound for the backoff.
    maximum_interval: Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time to wait before the next attempt, given how many attempts already failed
    /// in a row (0 after the first failure).
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        std::cmp::min(
            self.initial_interval.saturating_mul(factor),
            self.maximum_interval,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(500),
            maximum_interval: Duration::from_secs(30),
        }
    }
}
