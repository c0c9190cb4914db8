//! Retry policy with exponential backoff.
//!
//! The same policy drives two things:
//!
//! - the job worker, which reschedules a failed job `delay_for_attempt(n)`
//!   after its `n`-th failure and dead-letters it after `max_attempts`;
//! - [`retry_with_backoff`], which retries an in-process async call (asset
//!   uploads).
//!
//! # Example
//!
//! ```rust
//! use boxoffice_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let result = retry_with_backoff(&policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use boxoffice_core::jobs::ScheduledJob;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (first try included)
/// - `initial_delay`: 1 second
/// - `max_delay`: 5 minutes
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// The policy a stored job was scheduled with.
    #[must_use]
    pub fn for_job(job: &ScheduledJob) -> Self {
        Self::builder()
            .max_attempts(job.max_attempts)
            .initial_delay(job.backoff)
            .build()
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ retry)
    /// Capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    #[must_use]
    pub const fn allows_retry_after(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set initial delay before first retry.
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
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// The operation runs at most `policy.max_attempts` times.
///
/// # Errors
///
/// Returns the last error if every attempt failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !policy.allows_retry_after(attempt) {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
