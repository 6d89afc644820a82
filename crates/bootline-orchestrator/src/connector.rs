//! Lazy access to the cluster API
//!
//! The admin kubeconfig only exists once `init-cluster` (or `join-cluster`)
//! has run, so stages ask for a client when they need one instead of the
//! binary building it up front.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bootline_addons::{ClusterApi, KubeClusterApi};
use bootline_common::Result;
use tokio::sync::OnceCell;
use tracing::debug;

/// Hands out a connected [`ClusterApi`]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect, or return the already-connected client
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>>;
}

/// Connects with a kubeconfig file and caches the client for the rest of the run
pub struct KubeconfigConnector {
    kubeconfig: PathBuf,
    client: OnceCell<Arc<dyn ClusterApi>>,
}

impl KubeconfigConnector {
    /// Connector for `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        let api = self
            .client
            .get_or_try_init(|| async {
                debug!(kubeconfig = %self.kubeconfig.display(), "Connecting to cluster API");
                let api = KubeClusterApi::connect(&self.kubeconfig).await?;
                Ok::<_, bootline_common::Error>(Arc::new(api) as Arc<dyn ClusterApi>)
            })
            .await?;
        Ok(api.clone())
    }
}

/// Connector that always returns the same client
pub struct StaticConnector(pub Arc<dyn ClusterApi>);

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        Ok(self.0.clone())
    }
}
