//! Bounded retries with a fixed delay between attempts.
//!
//! Wraps operations with a nonzero chance of transient failure: downloads,
//! package installs, or manifest applies issued while the API server is
//! still warming up. Only [`ErrorKind::Transient`](crate::ErrorKind)
//! failures are retried; any other error is returned on the spot.
//!
//! # Example
//!
//! ```ignore
//! use bootline_common::retry::{retry, RetryPolicy};
//!
//! retry(&RetryPolicy::default(), "apply flannel", || async {
//!     api.apply_manifest(&doc).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::Error;

/// Attempt bound and inter-attempt delay for a retried operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given bound and delay
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A policy that makes exactly one attempt
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Run `operation` up to `policy.max_attempts` times.
///
/// Sleeps `policy.delay` between attempts (fixed, no backoff). Returns the
/// first success, the first non-transient error, or the last transient
/// error once attempts are exhausted. Every failed attempt is logged with
/// its ordinal.
pub async fn retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Operation failed after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    delay_ms = policy.delay.as_millis() as u64,
                    "Attempt {attempt}/{max_attempts} failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately() {
        let result = retry(&policy(), "op", || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_calls_three_times() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry(&policy(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("op", "flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_returns_last_error_after_three_calls() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = tokio::time::Instant::now();

        let result: Result<(), Error> = retry(&policy(), "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Error::transient("op", format!("failure #{n}")))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("failure #3"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // Two fixed delays between three attempts, no backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry(&policy(), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::configuration("manifest missing"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let _ = retry(&RetryPolicy::new(0, Duration::ZERO), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transient("op", "nope"))
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
