//! Retry with exponential backoff for transient failures.
//!
//! Retrying is driven by the error taxonomy: only categories marked
//! retryable ([`ServiceUnavailable`], [`Timeout`], [`RateLimited`]) are
//! worth another attempt. Retrying a bad request only wastes the retry
//! budget and delays the caller.
//!
//! # Example
//!
//! ```rust
//! use eventguard_runtime::retry::{RetryPolicy, retry_categorized};
//! use eventguard_core::{CategorizedError, ErrorCategory};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), CategorizedError> {
//! let policy = RetryPolicy::default()
//!     .with_max_retries(5)
//!     .with_initial_delay(Duration::from_millis(100));
//!
//! let value = retry_categorized(&policy, || async {
//!     Ok::<_, CategorizedError>(42)
//! }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```
//!
//! [`ServiceUnavailable`]: eventguard_core::ErrorCategory::ServiceUnavailable
//! [`Timeout`]: eventguard_core::ErrorCategory::Timeout
//! [`RateLimited`]: eventguard_core::ErrorCategory::RateLimited

use eventguard_core::CategorizedError;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy: attempt budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff delay for a given attempt number (0-based).
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms =
            (self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32)) as u64;
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// Retry an operation with exponential backoff, regardless of the error.
///
/// For failures that carry a classification, prefer [`retry_categorized`],
/// which stops early on non-retryable categories.
///
/// # Errors
///
/// Returns the last error once the retry budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempt >= policy.max_retries {
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry an operation, backing off between attempts, as long as the failure
/// is classified retryable.
///
/// # Errors
///
/// Returns the last [`CategorizedError`] once the failure is non-retryable
/// or the retry budget is exhausted.
pub async fn retry_categorized<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, CategorizedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CategorizedError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    tracing::warn!(
                        category = %err.category,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }
                if attempt >= policy.max_retries {
                    tracing::error!(
                        attempt,
                        category = %err.category,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    category = %err.category,
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventguard_core::{ErrorCategory, FailureSignals};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unavailable() -> CategorizedError {
        CategorizedError::classify(FailureSignals::new("down").with_status(503))
    }

    fn not_found() -> CategorizedError {
        CategorizedError::classify(FailureSignals::new("missing").with_status(404))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }

    proptest::proptest! {
        // The backoff never exceeds its cap and never shrinks between
        // consecutive attempts.
        #[test]
        fn backoff_is_monotonic_and_capped(
            initial_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            attempt in 0u32..20,
        ) {
            let policy = RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(cap_ms));

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            proptest::prop_assert!(current <= Duration::from_millis(cap_ms));
            proptest::prop_assert!(next >= current);
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_categorized(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CategorizedError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let policy = RetryPolicy::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_categorized(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_retries_any_error() {
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        // NotFound is non-retryable for the categorized variant, but this
        // one retries unconditionally.
        let result = retry_with_backoff(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(not_found())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_fails_on_first_attempt() {
        let policy = RetryPolicy::default().with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_categorized(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(not_found())
            }
        })
        .await;

        assert_eq!(result.unwrap_err().category, ErrorCategory::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_on_persistent_transient_failure() {
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_categorized(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(unavailable())
            }
        })
        .await;

        assert_eq!(
            result.unwrap_err().category,
            ErrorCategory::ServiceUnavailable
        );
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
