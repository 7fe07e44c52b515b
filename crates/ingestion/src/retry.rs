//! Retry policy for pipeline stages
//!
//! The executor owns the loop and persists the attempt counter; the policy
//! only answers "retry?" and "after how long?".

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use ledgerforge_common::config::PipelineConfig;
use ledgerforge_common::errors::AppError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per stage, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomization factor in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(600),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            jitter: config.jitter,
        }
    }

    /// Delay schedule for one stage run; the executor calls `next_backoff` after each failure
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_max_interval(self.max_delay)
            .with_randomization_factor(self.jitter.clamp(0.0, 1.0))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Whether another attempt is allowed after `attempts_made` attempts ended in `err`
    pub fn should_retry(&self, attempts_made: u32, err: &AppError) -> bool {
        err.is_transient() && attempts_made < self.max_attempts
    }

    pub fn next_delay(&self, schedule: &mut ExponentialBackoff) -> Duration {
        schedule.next_backoff().unwrap_or(self.max_delay).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = policy();
        let mut schedule = policy.backoff();
        let delays: Vec<Duration> = (0..4).map(|_| policy.next_delay(&mut schedule)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(300));
        assert_eq!(delays[3], Duration::from_millis(300));
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = policy();
        let transient = AppError::Timeout {
            operation: "ocr".into(),
            timeout_ms: 10,
        };
        let structural = AppError::InvalidFormat {
            message: "garbage".into(),
        };

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &structural));
    }

    #[test]
    fn test_from_config() {
        let config = PipelineConfig::default();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy, RetryPolicy::default());
    }
}
