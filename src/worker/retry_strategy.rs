use std::time::Duration;

/// Exponential backoff used between failed receives and before unlocking a
/// message that failed processing.
///
/// There is no attempt limit here: the receive loop never gives up, and the
/// broker's max delivery count bounds how often a message is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    base_delay_ms: u64,

    max_delay_ms: u64,
}

impl RetryStrategy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn default_strategy() -> Self {
        Self::new(500, 30_000)
    }

    /// Delay before attempt `attempt`: immediate for 0, then `base * 2^(attempt-1)`, capped
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = 2_u64.saturating_pow(attempt - 1);
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);

        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::default_strategy()
    }
}
