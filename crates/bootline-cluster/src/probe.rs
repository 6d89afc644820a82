//! Join-gate probes
//!
//! A secondary node must not join until the primary's API server is
//! reachable *and* the primary has published its cluster-ready signal.
//! Both checks are single polls; the bootstrapper wraps them in a
//! `ConditionWaiter`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bootline_common::kube_utils::create_client_with_timeout;
use bootline_common::{Error, Result, READY_SIGNAL_CONFIGMAP, READY_SIGNAL_NAMESPACE};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
#[cfg(test)]
use mockall::automock;
use tokio::net::TcpStream;

/// Timeout for a single probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-shot readiness probes against the primary
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinGate: Send + Sync {
    /// Whether the API server at `endpoint` accepts connections
    async fn api_reachable(&self, endpoint: &str) -> Result<bool>;

    /// Whether the primary has published the cluster-ready ConfigMap
    async fn ready_signal_present(&self) -> Result<bool>;
}

/// [`JoinGate`] using a TCP connect and the shared admin kubeconfig
pub struct ClusterJoinGate {
    kubeconfig: PathBuf,
}

impl ClusterJoinGate {
    /// Probe the cluster described by `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }
}

#[async_trait]
impl JoinGate for ClusterJoinGate {
    async fn api_reachable(&self, endpoint: &str) -> Result<bool> {
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(Error::transient(
                "api_reachable",
                format!("connect to {endpoint}: {e}"),
            )),
            Err(_) => Err(Error::transient(
                "api_reachable",
                format!("connect to {endpoint} timed out"),
            )),
        }
    }

    async fn ready_signal_present(&self) -> Result<bool> {
        let client = create_client_with_timeout(&self.kubeconfig, PROBE_TIMEOUT, PROBE_TIMEOUT)
            .await?;
        let api: Api<ConfigMap> = Api::namespaced(client, READY_SIGNAL_NAMESPACE);
        Ok(api.get_opt(READY_SIGNAL_CONFIGMAP).await?.is_some())
    }
}
