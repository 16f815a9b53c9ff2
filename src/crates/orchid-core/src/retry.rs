//! Retry policies with exponential backoff.
//!
//! Used by the agent tool loop for idempotent provider failures: the model
//! call is retried, never a tool that may have had side effects. Jitter
//! spreads simultaneous retries so a provider outage does not produce a
//! thundering herd when it recovers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial interval between retries, in seconds.
    pub initial_interval: f64,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Upper bound on any single interval, in seconds.
    pub max_interval: f64,
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Randomize each interval by 0.5x–1.5x.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 60.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let mut seconds = base.min(self.max_interval);
        if self.jitter {
            let factor: f64 = 0.5 + rand::random::<f64>();
            seconds = (seconds * factor).min(self.max_interval);
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_capped_at_max_interval() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(10.0)
            .with_max_interval(5.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(5));
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = RetryPolicy::new(3)
            .with_initial_interval(2.0)
            .with_max_interval(10.0);
        for attempt in 0..5 {
            let delay = policy.calculate_delay(attempt).as_secs_f64();
            assert!(delay <= 10.0, "delay {delay} exceeded max_interval");
        }
    }
}
