//! Retry policies and a bounded retry executor.
//!
//! A [`RetryPolicy`] is a plain value: how many attempts, and how long to wait
//! between them. Timing lives in the policy, not in the code that retries, so tests
//! can pass [`RetryPolicy::immediate`] and run without sleeping.
//!
//! Attempts are counted from 1. A policy with `max_attempts = 91` runs the operation
//! at most 91 times and sleeps at most 90 times, so it tolerates 90 failures.
//!
//! # Example
//!
//! ```rust
//! use billing_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Fixed delay: a first attempt plus 90 retries, 2 seconds apart
//! let readiness = RetryPolicy::with_retries(90, Duration::from_secs(2));
//!
//! // Exponential backoff
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let result = retry_with_backoff(&policy, "example", || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy: attempt budget plus delay schedule.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles after each failure)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
    /// Growth factor applied after each failure; 1.0 means fixed delay
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Failed readiness attempts tolerated at process start.
    pub const READINESS_RETRIES: usize = 90;

    /// Readiness attempts at process start: the first one plus every retry.
    pub const READINESS_ATTEMPTS: usize = Self::READINESS_RETRIES + 1;

    /// Delay between readiness attempts.
    pub const READINESS_DELAY: Duration = Duration::from_secs(2);

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: Some(3),
            initial_delay: Some(Duration::from_millis(100)),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: Some(2.0),
        }
    }

    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    pub const fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Bounded attempts with no delay at all.
    #[must_use]
    pub const fn immediate(max_attempts: usize) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Fixed delay with a first attempt followed by up to `retries` more.
    #[must_use]
    pub const fn with_retries(retries: usize, delay: Duration) -> Self {
        Self::fixed(retries.saturating_add(1), delay)
    }

    /// Failures this policy tolerates before giving up.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.max_attempts.saturating_sub(1)
    }

    /// Database readiness policy: 90 retries after the first attempt, 2 seconds
    /// apart (3 minutes of sleeping at most).
    #[must_use]
    pub const fn readiness() -> Self {
        Self::fixed(Self::READINESS_ATTEMPTS, Self::READINESS_DELAY)
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// `initial_delay * multiplier ^ (attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Worst-case time spent sleeping before the policy is exhausted.
    #[must_use]
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|attempt| self.delay_for_attempt(attempt)).sum()
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
        }
    }
}

/// Run an async operation until it succeeds or the policy is exhausted.
///
/// Each failure is logged with its attempt number and swallowed; only the error of
/// the final attempt is returned. A policy with `max_attempts == 0` still runs the
/// operation once.
///
/// # Arguments
///
/// * `policy` - Attempt budget and delay schedule
/// * `operation` - Label used in log lines
/// * `f` - Async operation to retry (`FnMut` so it can be called repeatedly)
///
/// # Errors
///
/// Returns the error of the last attempt once all attempts have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        RetryMetrics::record_attempt(operation);

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Operation succeeded after retry");
                    RetryMetrics::record_success(operation);
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    RetryMetrics::record_exhausted(operation);
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
