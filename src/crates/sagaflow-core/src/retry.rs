//! Retry policies - exponential backoff for transient failures
//!
//! Transient transport errors (store unavailable, mediator timeout) are not
//! flow failures on their own: the executor retries the in-flight operation
//! with backoff up to a small bound, and only then releases its lease so
//! another node can claim the flow.
//!
//! The policy provides:
//! - **Exponential backoff** - progressively longer delays between retries
//! - **Jitter** - random variation so a fleet of nodes recovering from the
//!   same outage does not retry in lockstep
//! - **Configurable limits** - max attempts, initial/max intervals
//!
//! # Example
//!
//! ```rust
//! use sagaflow_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(0.1)
//!     .with_backoff_factor(2.0)
//!     .with_max_interval(5.0)
//!     .with_jitter(true);
//!
//! for attempt in 0..7 {
//!     if !policy.should_retry(attempt) {
//!         break;
//!     }
//!     let _delay = policy.calculate_delay(attempt);
//! }
//! ```

use rand::Rng;
use std::time::Duration;

/// Configuration for retrying transient store and mediator failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.2,
            backoff_factor: 2.0,
            max_interval: 10.0,
            jitter: true,
        }
    }

    /// Set the initial interval between retries
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    ///
    /// Exponential backoff `initial_interval * backoff_factor^attempt`,
    /// capped at `max_interval`, with optional jitter (0.5x to 1.5x).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_secs_f64(1.0));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs_f64(4.0));
    }

    #[test]
    fn test_delay_caps_at_max_interval() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(10.0)
            .with_max_interval(5.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(4), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3)
            .with_initial_interval(1.0)
            .with_jitter(true);

        for _ in 0..100 {
            let delay = policy.calculate_delay(0).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay));
        }
    }
}
