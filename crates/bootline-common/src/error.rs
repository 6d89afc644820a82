//! Error types for bootline
//!
//! Every variant carries enough context to diagnose a failed boot from the
//! log file alone. [`Error::kind`] folds the variants into the four failure
//! classes the pipeline reasons about: only [`ErrorKind::Transient`] is ever
//! retried, everything else halts the containing stage immediately.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure classes used for retry and halt decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected to resolve on retry (network blip, API server warming up)
    Transient,
    /// A readiness gate reached its deadline
    ReadinessTimeout,
    /// A required input (join file, credentials, manifest) is missing or invalid
    Configuration,
    /// Anything else; halts the pipeline
    Fatal,
}

/// Main error type for bootline operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Failure that is expected to go away on retry
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Operation that failed (e.g., "apply_manifest", "helm")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A readiness gate timed out
    #[error("timed out after {waited:?} waiting for {description}{}{}",
        .last_observation.as_ref().map(|o| format!(" (last observed: {o})")).unwrap_or_default(),
        .last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    ReadinessTimeout {
        /// What was being waited for
        description: String,
        /// How long the gate waited before giving up
        waited: Duration,
        /// Last diagnostic snapshot reported by the predicate
        last_observation: Option<String>,
        /// Last error returned by the predicate, if it was failing
        last_error: Option<String>,
    },

    /// Missing or invalid input
    #[error("configuration error: {message}{}", .path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    Configuration {
        /// Description of what's missing or invalid
        message: String,
        /// The offending file, if any
        path: Option<PathBuf>,
    },

    /// Unrecoverable failure
    #[error("fatal error [{context}]: {message}")]
    Fatal {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// An external command exited unsuccessfully
    #[error("command `{program} {}` failed ({status}): {stderr}", .args.join(" "))]
    Command {
        /// Program that was invoked
        program: String,
        /// Arguments passed to the program
        args: Vec<String>,
        /// Exit status description
        status: String,
        /// Trimmed standard error output
        stderr: String,
    },

    /// A completion marker could not be persisted
    #[error("failed to persist completion marker for stage {stage}: {source}")]
    StateStore {
        /// Stage whose marker failed to persist
        stage: String,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// A stage action exceeded its configured timeout
    #[error("stage {stage} exceeded its timeout of {timeout:?}")]
    StageTimeout {
        /// Stage name
        stage: String,
        /// Configured stage timeout
        timeout: Duration,
    },

    /// A pipeline stage failed
    #[error("stage {stage} failed: {source}")]
    StageFailed {
        /// Stage name
        stage: String,
        /// The error returned by the stage action
        source: Box<Error>,
    },
}

impl Error {
    /// Create a transient error
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error without a file reference
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: None,
        }
    }

    /// Create a configuration error pointing at a specific file
    pub fn configuration_at(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: Some(path.into()),
        }
    }

    /// Create a fatal error
    pub fn fatal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fatal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(
        description: impl Into<String>,
        waited: Duration,
        last_observation: Option<String>,
        last_error: Option<String>,
    ) -> Self {
        Self::ReadinessTimeout {
            description: description.into(),
            waited,
            last_observation,
            last_error,
        }
    }

    /// Wrap an error with the name of the stage it escaped from
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Reclassify this error as fatal, keeping its message.
    ///
    /// Used by call sites whose operation must not be retried blindly
    /// (cluster init and join).
    pub fn into_fatal(self, context: impl Into<String>) -> Self {
        match self.kind() {
            ErrorKind::Fatal => self,
            _ => Self::fatal(context, self.to_string()),
        }
    }

    /// Classify this error into the retry/halt taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Kube { source } => kube_error_kind(source),
            Self::Transient { .. } | Self::Command { .. } => ErrorKind::Transient,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Fatal { .. } | Self::StateStore { .. } | Self::StageTimeout { .. } => {
                ErrorKind::Fatal
            }
            Self::StageFailed { source, .. } => source.kind(),
        }
    }

    /// Whether a retry wrapper may attempt the operation again
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Server errors, throttling and transport failures are worth retrying;
/// client errors (bad manifest, forbidden) are not.
fn kube_error_kind(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => ErrorKind::Transient,
        kube::Error::Api(_) => ErrorKind::Fatal,
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::HttpError(_) => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code,
        })
    }

    #[test]
    fn api_server_warming_up_is_transient() {
        assert_eq!(Error::from(api_error(503)).kind(), ErrorKind::Transient);
        assert_eq!(Error::from(api_error(429)).kind(), ErrorKind::Transient);
    }

    #[test]
    fn rejected_requests_are_fatal() {
        assert_eq!(Error::from(api_error(422)).kind(), ErrorKind::Fatal);
        assert_eq!(Error::from(api_error(403)).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn missing_join_file_is_a_configuration_error() {
        let err = Error::configuration_at("/var/lib/bootline/join/join-command.sh", "not found");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("join-command.sh"));
    }

    #[test]
    fn readiness_timeout_reports_last_snapshot_and_error() {
        let err = Error::readiness_timeout(
            "daemonset kube-flannel/kube-flannel-ds",
            Duration::from_secs(300),
            Some("1/3 ready".to_string()),
            Some("connection refused".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("kube-flannel-ds"));
        assert!(msg.contains("1/3 ready"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
    }

    #[test]
    fn stage_wrapper_keeps_inner_classification() {
        let err = Error::transient("helm", "repo unreachable").in_stage("deploy-monitoring");
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("stage deploy-monitoring failed"));

        let err = Error::configuration("no manifest").in_stage("deploy-ingress");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn command_failures_become_fatal_when_reclassified() {
        let err = Error::Command {
            program: "kubeadm".to_string(),
            args: vec!["init".to_string()],
            status: "exit status: 1".to_string(),
            stderr: "port 6443 in use".to_string(),
        };
        assert!(err.is_transient());

        let err = err.into_fatal("kubeadm_init");
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("port 6443 in use"));
    }
}
