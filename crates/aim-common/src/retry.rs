//! Bounded retries with exponential backoff.
//!
//! [`Backoff`] yields the delay schedule on its own so loops with extra exit
//! conditions (health polling with cancellation) can share it, and
//! [`retry_with_backoff`] wraps the common "call until it works" case used for
//! artifact fetches.
//!
//! # Example
//!
//! ```ignore
//! use aim_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let bytes = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "fetch_artifact",
//!     || async { fetcher.fetch("Qwen/Qwen3-32B", &dest).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Retry schedule for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (must be >= 1)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failure
    pub backoff_multiplier: f64,
    /// Randomise each delay to 0.5x..1.5x to avoid synchronised retries
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Deterministic doubling schedule without jitter
    ///
    /// Used for health polling, where the delays are part of the contract.
    pub fn doubling(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Start a fresh backoff schedule
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            next: self.initial_delay,
        }
    }
}

/// Stateful delay generator for one retry loop.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
}

impl Backoff {
    /// Delay to wait before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = Duration::from_secs_f64(
            (base.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        }
    }
}

/// Execute an async operation with bounded exponential backoff.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. `operation_name` is only used for logging.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but errors for which `should_retry` returns
/// false are returned at once.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = config.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed with a permanent error"
                );
                return Err(e);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
