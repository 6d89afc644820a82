//! Common building blocks for bootline: errors, logging, the stage state
//! store, readiness waits, retries, boot configuration and kube-rs helpers.

#![deny(missing_docs)]

pub mod command;
pub mod config;
pub mod error;
pub mod kube_utils;
pub mod logging;
pub mod retry;
pub mod state;
pub mod wait;
pub mod yaml;

pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every server-side apply issued by bootline
pub const FIELD_MANAGER: &str = "bootline";

/// Sentinel written as the final log line of a successful pipeline run.
///
/// Remote monitoring scripts poll the log file for this exact string.
pub const BOOTSTRAP_COMPLETE_SENTINEL: &str = "BOOTLINE_BOOTSTRAP_COMPLETE";

/// Namespace holding the cluster-ready sentinel ConfigMap
pub const READY_SIGNAL_NAMESPACE: &str = "kube-system";

/// Name of the ConfigMap the primary publishes once its core addons are ready
pub const READY_SIGNAL_CONFIGMAP: &str = "bootline-cluster-ready";

/// Port the Kubernetes API server listens on
pub const API_SERVER_PORT: u16 = 6443;
