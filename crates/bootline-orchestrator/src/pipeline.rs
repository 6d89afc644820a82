//! Pipeline executor
//!
//! Runs an ordered list of named stages exactly once each across reboots:
//!
//! ```text
//! Pending -> Running(stage_i) -> {Skipped | Completed} -> Running(stage_i+1) -> ... -> Done
//!                             \-> Failed
//! ```
//!
//! A stage whose marker exists in the [`StateStore`] is skipped. Any other
//! stage runs under its own timeout and retry policy; on success its marker
//! is persisted before the next stage starts. The first failure halts the
//! pipeline. There is no pipeline-level retry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bootline_common::retry::{retry, RetryPolicy};
use bootline_common::state::StateStore;
use bootline_common::{Error, Result, BOOTSTRAP_COMPLETE_SENTINEL};
use tokio::time::Instant;
use tracing::{error, info};

/// Default upper bound on a single stage
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// The body of a stage
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Perform the stage's side effects. Must be safe to re-run after a
    /// crash that happened before the stage's marker was written.
    async fn run(&self) -> Result<()>;
}

/// A named, ordered, idempotent unit of pipeline work
pub struct Stage {
    name: String,
    timeout: Duration,
    retry: RetryPolicy,
    action: Box<dyn StageAction>,
}

impl Stage {
    /// Stage with the default timeout and a single attempt
    pub fn new(name: impl Into<String>, action: impl StageAction + 'static) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry: RetryPolicy::once(),
            action: Box::new(action),
        }
    }

    /// Override the stage timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the stage retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Idempotency key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upper bound on the whole stage, retries included
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<()> {
        let attempts = retry(&self.retry, &self.name, || self.action.run());
        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(Error::StageTimeout {
                stage: self.name.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// What happened to one stage during a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Marker already present
    Skipped,
    /// Ran and persisted its marker
    Completed(Duration),
}

/// Result of a pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    /// Outcome of every stage reached, in order
    pub outcomes: Vec<(String, StageOutcome)>,
    /// The stage that halted the pipeline, if any
    pub failure: Option<Error>,
}

impl PipelineReport {
    /// All stages completed or were skipped
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Process exit code: 0 on success, 1 on any stage failure
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Names of stages that were skipped
    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(|o| *o == StageOutcome::Skipped)
    }

    /// Names of stages that ran to completion in this run
    pub fn completed(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, StageOutcome::Completed(_)))
    }

    fn names_where(&self, pred: impl Fn(&StageOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Ordered stages plus the ledger that makes them resumable
pub struct Pipeline {
    stages: Vec<Stage>,
    store: Arc<dyn StateStore>,
}

impl Pipeline {
    /// Build a pipeline. Stage names must be unique.
    pub fn new(stages: Vec<Stage>, store: Arc<dyn StateStore>) -> Result<Self> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate stage name {:?}",
                    stage.name
                )));
            }
        }
        Ok(Self { stages, store })
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run every stage in order, halting at the first failure.
    ///
    /// On success the last log line carries the completion sentinel; on
    /// failure the last `[ERROR]` line names the failed stage.
    pub async fn run(&self) -> PipelineReport {
        let total = self.stages.len();
        let mut outcomes = Vec::with_capacity(total);

        info!(stages = total, "Bootstrap pipeline starting");

        for (index, stage) in self.stages.iter().enumerate() {
            let position = index + 1;

            if self.store.is_complete(&stage.name) {
                info!(stage = %stage.name, "[{position}/{total}] Stage {} already complete, skipping", stage.name);
                outcomes.push((stage.name.clone(), StageOutcome::Skipped));
                continue;
            }

            info!(stage = %stage.name, timeout_secs = stage.timeout.as_secs(), "[{position}/{total}] Stage {} starting", stage.name);
            let start = Instant::now();

            let result = match stage.execute().await {
                Ok(()) => self.store.mark_complete(&stage.name),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    info!(
                        stage = %stage.name,
                        elapsed_secs = elapsed.as_secs_f64(),
                        "[{position}/{total}] Stage {} completed",
                        stage.name
                    );
                    outcomes.push((stage.name.clone(), StageOutcome::Completed(elapsed)));
                }
                Err(e) => {
                    error!(stage = %stage.name, error = %e, error_kind = ?e.kind(), "Stage {} failed: {e}", stage.name);
                    error!(stage = %stage.name, "Bootstrap halted at stage {}", stage.name);
                    return PipelineReport {
                        outcomes,
                        failure: Some(e.in_stage(&stage.name)),
                    };
                }
            }
        }

        let report = PipelineReport {
            outcomes,
            failure: None,
        };
        info!(
            completed = report.completed().len(),
            skipped = report.skipped().len(),
            "{BOOTSTRAP_COMPLETE_SENTINEL}: all {total} stages complete"
        );
        report
    }
}
