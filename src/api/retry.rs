//! Exponential backoff policy for control-plane calls
//!
//! Deliberately jitter-free: delays are exactly `base × 2^attempt` so the
//! negative-ack timing seen by devices is predictable.

use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts beyond the first
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt, saturating well past any sane configuration
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn huge_attempt_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_retries: 64,
            base_delay: Duration::from_secs(1),
        };

        let delay = policy.delay_for_attempt(40);
        assert!(delay >= policy.delay_for_attempt(31));
    }
}
