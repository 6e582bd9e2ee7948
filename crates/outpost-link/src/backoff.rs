use std::time::Duration;

use outpost_settings::LinkSettings;

/// Reconnect schedule: `min(base * 2^(attempt-1), max)` for attempts
/// `1..=max_attempts`. No jitter: one process owns one server connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
            max_attempts: 5,
        }
    }
}

impl From<&LinkSettings> for ReconnectPolicy {
    fn from(s: &LinkSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(s.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(s.reconnect_max_delay_ms),
            max_attempts: s.reconnect_max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`. Attempt 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether the 1-based `attempt` may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
