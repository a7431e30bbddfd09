//! Exponential backoff policy for failed deliveries.
//!
//! The queue re-delivers a failed job after `base_delay * 2^(n-1)` for
//! attempt n, capped and optionally jittered. With the defaults the
//! sequence is 2s, 4s, 8s, 16s, 32s across the five permitted attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration for delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts per send, including the first.
    pub max_attempts: u32,

    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to the computed delay.
    /// Zero keeps the schedule exact.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Whether a send that has started `attempts_made` attempts is out
    /// of budget.
    pub fn attempts_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Delay before re-delivering after the given attempt (1-based).
    pub fn delay_after_attempt(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        apply_jitter(delay, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomises a delay by ±`jitter_factor` to avoid thundering herds.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();

        let delays: Vec<Duration> =
            (1..=5).map(|attempt| policy.delay_after_attempt(attempt)).collect();

        assert_eq!(
            delays,
            [
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(32),
            ]
        );
    }

    #[test]
    fn max_delay_caps_backoff() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(10), ..Default::default() };

        assert_eq!(policy.delay_after_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn attempt_budget_enforced() {
        let policy = RetryPolicy::default();

        assert!(!policy.attempts_exhausted(4));
        assert!(policy.attempts_exhausted(5));
        assert!(policy.attempts_exhausted(6));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..Default::default() };

        for _ in 0..20 {
            let delay = policy.delay_after_attempt(3); // nominal 8s
            assert!(delay >= Duration::from_secs(4), "too small: {delay:?}");
            assert!(delay <= Duration::from_secs(12), "too large: {delay:?}");
        }
    }
}
