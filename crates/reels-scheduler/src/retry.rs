//! Retry policy shared by the generation and publish dispatchers.

use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

/// Exponential backoff parameters.
///
/// Without jitter the n-th retry waits `min(base_delay * factor^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Randomization factor in `[0, 1)`; 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry budget and default timing.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Build a fresh backoff sequence for one item.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: self.jitter,
            multiplier: self.factor,
            max_interval: self.max_delay,
            max_elapsed_time: None, // Bounded by max_retries instead
            ..ExponentialBackoff::default()
        }
    }

    /// Delay before the given retry (0-based), ignoring jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(retry.min(64) as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;
    use proptest::prelude::*;

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30)); // Capped at max
    }

    #[test]
    fn test_backoff_matches_delay_for() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            factor: 3.0,
            max_delay: Duration::from_secs(2),
            jitter: 0.0,
        };
        let mut backoff = policy.backoff();

        for retry in 0..6 {
            let next = backoff.next_backoff().unwrap();
            let expected = policy.delay_for(retry);
            let diff = next.as_millis().abs_diff(expected.as_millis());
            assert!(diff <= 1, "retry {}: {:?} vs {:?}", retry, next, expected);
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        let next = backoff.next_backoff().unwrap();
        assert_eq!(next.as_millis(), policy.base_delay.as_millis());
    }

    proptest! {
        // Delay is always within [base, max]
        #[test]
        fn delay_is_bounded(retry in 0u32..200, factor in 1.0f64..4.0) {
            let policy = RetryPolicy { factor, ..RetryPolicy::default() };
            let delay = policy.delay_for(retry);

            prop_assert!(delay >= policy.base_delay);
            prop_assert!(delay <= policy.max_delay);
        }

        // More retries never wait less
        #[test]
        fn delay_non_decreasing(a in 0u32..50, b in 0u32..50) {
            let policy = RetryPolicy::default();
            if a <= b {
                prop_assert!(policy.delay_for(a) <= policy.delay_for(b));
            }
        }
    }
}
