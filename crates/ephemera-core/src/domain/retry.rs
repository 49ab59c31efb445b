//! Retry policy: decides backoff delays and the attempt budget.

use std::time::Duration;

/// Retry policy for retriable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Standard policy: 5s base, x3 per attempt, 3 attempts.
    pub fn standard() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 3.0,
            max_attempts: 3,
        }
    }

    /// Calculate the delay after a failed attempt.
    ///
    /// # Arguments
    /// * `attempts` - Number of attempts already made (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1)
    ///
    /// With the standard policy:
    /// - attempt 1 failed: 5s
    /// - attempt 2 failed: 15s
    /// - attempt 3 failed: 45s (only reached by policies with more attempts)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }

    /// May another attempt be made after `attempts` failures?
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_policy_values() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn exponential_backoff_schedule() {
        let policy = RetryPolicy::standard();

        assert_eq!(policy.next_delay(1), Duration::from_secs(5));
        assert_eq!(policy.next_delay(2), Duration::from_secs(15));
        assert_eq!(policy.next_delay(3), Duration::from_secs(45));
    }

    #[test]
    fn attempt_budget_stops_at_max() {
        let policy = RetryPolicy::standard();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
