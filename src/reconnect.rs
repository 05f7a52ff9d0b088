use std::time::Duration;

const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff for reconnection attempts.
///
/// Purely computational: the transport owns the attempt counter and the
/// single pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(BASE_DELAY_MS),
            max: Duration::from_millis(MAX_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let delay_ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| base_ms.checked_mul(factor))
            .map_or(max_ms, |ms| ms.min(max_ms));
        Duration::from_millis(delay_ms)
    }
}

/// Backoff delay for `attempt` under the default 1s/30s policy.
pub fn delay(attempt: u32) -> Duration {
    ReconnectPolicy::default().delay(attempt)
}
