//! Retry policy for failed messages

use crate::config::{duration_ms, option_duration_ms};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration
///
/// `delay_for_attempt(n) = initial_delay * multiplier^(n - 1)`, optionally
/// capped by `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay (`None` = unbounded)
    #[serde(default, with = "option_duration_ms")]
    pub max_delay: Option<Duration>,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), 2.0)
    }
}

impl RetryPolicy {
    /// Create an uncapped exponential policy
    pub fn new(max_retries: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: None,
            multiplier,
        }
    }

    /// Create a retry policy with exponential backoff
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: 2.0,
        }
    }

    /// Create a retry policy with fixed delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: Some(delay),
            multiplier: 1.0,
        }
    }

    /// Create a no-retry policy: the first failure dead-letters the message
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Some(Duration::ZERO),
            multiplier: 1.0,
        }
    }

    /// Set the delay cap (builder pattern)
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Calculate delay for a given retry attempt (1-based)
    ///
    /// Degenerate inputs clamp to zero: a NaN, infinite, negative or
    /// overflowing product means "re-enqueue immediately".
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.max_retries == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_us = (self.initial_delay.as_micros() as f64) * self.multiplier.powi(exponent);
        if !delay_us.is_finite() || delay_us <= 0.0 || delay_us >= u64::MAX as f64 {
            return Duration::ZERO;
        }

        let delay = Duration::from_micros(delay_us as u64);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Check if retry is allowed for a message that has been retried `retry_count` times
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert!(!policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, None);
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = RetryPolicy::exponential(3);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Some(Duration::from_secs(30)));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::exponential(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), 2.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(80));
    }

    #[test]
    fn test_delay_for_attempt_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), 2.0)
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        // 8s and 16s, capped
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn test_degenerate_multipliers_clamp_to_zero() {
        let negative = RetryPolicy::new(3, Duration::from_millis(100), -2.0);
        assert_eq!(negative.delay_for_attempt(2), Duration::ZERO);

        let zero = RetryPolicy::new(3, Duration::from_millis(100), 0.0);
        assert_eq!(zero.delay_for_attempt(2), Duration::ZERO);

        let nan = RetryPolicy::new(3, Duration::from_millis(100), f64::NAN);
        assert_eq!(nan.delay_for_attempt(2), Duration::ZERO);

        let infinite = RetryPolicy::new(3, Duration::from_millis(100), f64::INFINITY);
        assert_eq!(infinite.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_overflow_clamps_to_zero() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(3600), 10.0);
        assert_eq!(policy.delay_for_attempt(400), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_serialization() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), 2.0);
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"initial_delay\":10"));

        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }

    #[test]
    fn test_retry_policy_deserialize_without_max_delay() {
        let json = r#"{"max_retries":4,"initial_delay":50,"multiplier":1.5}"#;
        let parsed: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.max_retries, 4);
        assert_eq!(parsed.max_delay, None);
        assert_eq!(parsed.delay_for_attempt(2), Duration::from_millis(75));
    }
}
