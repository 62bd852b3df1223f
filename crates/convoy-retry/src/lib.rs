//! Retry and backoff policies for the convoy execution engine.
//!
//! This crate provides the backoff schedule used when a package execution
//! fails with a transient error: exponential growth from a base delay,
//! capped at a maximum, with a small additive jitter so that concurrently
//! retrying packages do not stampede a shared resource.
//!
//! # Example
//!
//! ```
//! use convoy_retry::{RetryConfig, delay_for_attempt};
//! use std::time::Duration;
//!
//! let config = RetryConfig::default();
//! assert_eq!(config.max_attempts, 3);
//!
//! // Attempt 1 waits the base delay, attempt 2 doubles it.
//! assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(5));
//! assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the retry schedule applied to transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of execution attempts per package (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Cap on the computed delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay for each further attempt.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(5_000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(60_000)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// A schedule with no delay between attempts. Test configs and dry runs
    /// use this so retries do not stall the loop.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` tries so far.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Deterministic delay for retry attempt `attempt` (1-indexed), before jitter:
/// `min(initial_delay * multiplier^(attempt-1), max_delay)`.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let factor = config.backoff_multiplier.max(0.0).powi(exp as i32);
    let millis = (config.initial_delay.as_millis() as f64 * factor).round();
    let capped = if millis.is_finite() {
        (millis as u128).min(config.max_delay.as_millis())
    } else {
        config.max_delay.as_millis()
    };
    Duration::from_millis(capped as u64)
}

/// Delay for attempt `attempt` with jitter applied: a uniform random amount
/// in `[0, 10%)` of the deterministic delay is added on top.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = delay_for_attempt(config, attempt);
    base + jitter_for(base)
}

fn jitter_for(delay: Duration) -> Duration {
    use rand::Rng;

    let ceiling = delay.as_millis() as f64 * 0.1;
    if ceiling < 1.0 {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(0.0..ceiling) as u64)
}
