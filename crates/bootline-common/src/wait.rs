//! Poll-until-true readiness gates.
//!
//! [`ConditionWaiter`] is the only way bootline waits for an external system
//! to reach a state: API server health, deployment rollouts, daemonset ready
//! counts, sentinel objects. The predicate is polled at a fixed interval
//! until it reports satisfied or `max_wait` elapses, so every wait returns
//! control to the caller in bounded time.
//!
//! A predicate that errors is treated as "not yet satisfied". If it is still
//! erroring when the deadline passes, the last error is attached to the
//! timeout report.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, Result};

/// Default interval between predicate polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Parameters of a single readiness gate. Constructed per call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionCheck {
    /// Human-readable description, used in every log line about this gate
    pub description: String,
    /// Upper bound on the total wait
    pub max_wait: Duration,
    /// Delay between polls
    pub interval: Duration,
}

impl ConditionCheck {
    /// Create a check with an explicit interval
    pub fn new(description: impl Into<String>, max_wait: Duration, interval: Duration) -> Self {
        Self {
            description: description.into(),
            max_wait,
            interval,
        }
    }

    /// Create a check polling at [`DEFAULT_POLL_INTERVAL`]
    pub fn with_default_interval(description: impl Into<String>, max_wait: Duration) -> Self {
        Self::new(description, max_wait, DEFAULT_POLL_INTERVAL)
    }
}

/// One poll result, optionally carrying a diagnostic snapshot such as
/// `"2/3 replicas ready"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    /// Whether the condition holds
    pub satisfied: bool,
    /// Diagnostic state at poll time
    pub detail: Option<String>,
}

impl Observation {
    /// The condition holds
    pub fn satisfied() -> Self {
        Self {
            satisfied: true,
            detail: None,
        }
    }

    /// The condition holds, with a final snapshot
    pub fn satisfied_with(detail: impl Into<String>) -> Self {
        Self {
            satisfied: true,
            detail: Some(detail.into()),
        }
    }

    /// Not there yet
    pub fn pending(detail: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            detail: Some(detail.into()),
        }
    }
}

impl From<bool> for Observation {
    fn from(satisfied: bool) -> Self {
        Self {
            satisfied,
            detail: None,
        }
    }
}

/// Result of a finished wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Whether the condition was met before the deadline
    pub satisfied: bool,
    /// Time spent waiting
    pub elapsed: Duration,
    /// Last diagnostic snapshot from the predicate
    pub last_observation: Option<String>,
    /// Last error from the predicate, cleared by any successful poll
    pub last_error: Option<String>,
}

impl WaitOutcome {
    /// Convert a timed-out wait into [`Error::ReadinessTimeout`]
    pub fn into_result(self, check: &ConditionCheck) -> Result<Duration> {
        if self.satisfied {
            Ok(self.elapsed)
        } else {
            Err(Error::readiness_timeout(
                check.description.clone(),
                self.elapsed,
                self.last_observation,
                self.last_error,
            ))
        }
    }
}

/// Blocking poll loop shared by every readiness gate.
#[derive(Clone, Debug, Default)]
pub struct ConditionWaiter {
    cancel: Option<CancellationToken>,
}

impl ConditionWaiter {
    /// Create a waiter whose waits end only by success or timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a waiter whose waits also end when `token` is cancelled
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
        }
    }

    /// Poll `predicate` until it is satisfied or `check.max_wait` elapses.
    ///
    /// Logs one info line on success or one error line on timeout.
    pub async fn wait<F, Fut, O>(&self, check: &ConditionCheck, mut predicate: F) -> WaitOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<O>>,
        O: Into<Observation>,
    {
        let start = Instant::now();
        let mut last_observation = None;
        let mut last_error = None;

        loop {
            match predicate().await {
                Ok(obs) => {
                    let obs: Observation = obs.into();
                    last_error = None;
                    if obs.detail.is_some() {
                        last_observation = obs.detail;
                    }
                    if obs.satisfied {
                        let elapsed = start.elapsed();
                        info!(
                            condition = %check.description,
                            elapsed_secs = elapsed.as_secs_f64(),
                            "Condition satisfied: {} (after {:.1}s)",
                            check.description,
                            elapsed.as_secs_f64()
                        );
                        return WaitOutcome {
                            satisfied: true,
                            elapsed,
                            last_observation,
                            last_error,
                        };
                    }
                    debug!(
                        condition = %check.description,
                        observed = ?last_observation,
                        "Condition not yet met"
                    );
                }
                Err(e) => {
                    debug!(condition = %check.description, error = %e, "Condition check errored (will retry)");
                    last_error = Some(e.to_string());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= check.max_wait {
                error!(
                    condition = %check.description,
                    elapsed_secs = elapsed.as_secs_f64(),
                    last_observation = ?last_observation,
                    last_error = ?last_error,
                    "Timed out waiting for {}",
                    check.description
                );
                return WaitOutcome {
                    satisfied: false,
                    elapsed,
                    last_observation,
                    last_error,
                };
            }

            let pause = check.interval.min(check.max_wait - elapsed);
            if !self.sleep(pause).await {
                let elapsed = start.elapsed();
                error!(
                    condition = %check.description,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Wait cancelled for {}",
                    check.description
                );
                return WaitOutcome {
                    satisfied: false,
                    elapsed,
                    last_observation: Some("wait cancelled".to_string()),
                    last_error,
                };
            }
        }
    }

    /// Same as [`wait`](Self::wait), returning a readiness timeout error when
    /// the condition is not met in time.
    pub async fn wait_for<F, Fut, O>(&self, check: &ConditionCheck, predicate: F) -> Result<Duration>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<O>>,
        O: Into<Observation>,
    {
        self.wait(check, predicate).await.into_result(check)
    }

    /// Sleep for `pause`; returns false if cancelled first
    async fn sleep(&self, pause: Duration) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = tokio::time::sleep(pause) => true,
                _ = token.cancelled() => false,
            },
            None => {
                tokio::time::sleep(pause).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn check(max_wait: u64, interval: u64) -> ConditionCheck {
        ConditionCheck::new(
            "test condition",
            Duration::from_secs(max_wait),
            Duration::from_secs(interval),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_predicate_times_out_at_max_wait() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let outcome = ConditionWaiter::new()
            .wait(&check(30, 5), || {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await;

        assert!(!outcome.satisfied);
        assert!(outcome.elapsed >= Duration::from_secs(30));
        assert!(outcome.elapsed < Duration::from_secs(31));
        // Polls at t = 0, 5, 10, 15, 20, 25, 30
        assert_eq!(polls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_predicate_returns_elapsed_time() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let outcome = ConditionWaiter::new()
            .wait(&check(60, 5), || {
                let p = p.clone();
                async move { Ok(p.fetch_add(1, Ordering::SeqCst) >= 2) }
            })
            .await;

        assert!(outcome.satisfied);
        assert!(outcome.elapsed >= Duration::from_secs(10));
        assert!(outcome.elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_errors_are_reported_on_timeout() {
        let check = check(20, 5);
        let outcome = ConditionWaiter::new()
            .wait(&check, || async {
                Err::<bool, _>(Error::transient("probe", "connection refused"))
            })
            .await;

        assert!(!outcome.satisfied);
        assert_eq!(outcome.last_error.as_deref(), Some("transient error [probe]: connection refused"));

        let err = outcome.into_result(&check).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.kind(), crate::ErrorKind::ReadinessTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_before_success_are_not_fatal() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let outcome = ConditionWaiter::new()
            .wait(&check(60, 5), || {
                let p = p.clone();
                async move {
                    if p.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(Error::transient("probe", "api not up"))
                    } else {
                        Ok(true)
                    }
                }
            })
            .await;

        assert!(outcome.satisfied);
        assert!(outcome.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_last_diagnostic_snapshot() {
        let check = check(10, 5);
        let err = ConditionWaiter::new()
            .wait_for(&check, || async { Ok(Observation::pending("1/3 ready")) })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("1/3 ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_longer_than_max_wait_is_clamped() {
        let outcome = ConditionWaiter::new()
            .wait(&check(7, 60), || async { Ok(false) })
            .await;

        assert!(!outcome.satisfied);
        assert!(outcome.elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait_unsatisfied() {
        let token = CancellationToken::new();
        token.cancel();

        let outcome = ConditionWaiter::with_cancellation(token)
            .wait(&check(600, 5), || async { Ok(false) })
            .await;

        assert!(!outcome.satisfied);
        assert!(outcome.elapsed < Duration::from_secs(5));
        assert_eq!(outcome.last_observation.as_deref(), Some("wait cancelled"));
    }
}
