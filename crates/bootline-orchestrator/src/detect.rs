//! First-boot / re-entry detection
//!
//! A node counts as already bootstrapped only when all three signals
//! agree: the final stage marker exists, kubelet is running, and the node
//! is a Ready member of the cluster. A marker alone can be left behind by a
//! run that crashed before kubelet came up.

use std::sync::Arc;

use async_trait::async_trait;
use bootline_common::command::{args, CommandRunner};
use bootline_common::state::StateStore;
use bootline_common::Result;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::connector::ClusterConnector;

/// Name of the last stage for every role; its marker is the completion marker
pub const COMPLETION_STAGE: &str = "bootstrap-complete";

/// Systemd unit of the cluster-membership agent
pub const AGENT_UNIT: &str = "kubelet";

/// Live checks of this node's cluster membership
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipProbe: Send + Sync {
    /// kubelet is active
    async fn agent_active(&self) -> bool;

    /// `node` is registered with the cluster and Ready
    async fn cluster_member(&self, node: &str) -> Result<bool>;
}

/// [`MembershipProbe`] using systemctl and the cluster API
pub struct NodeMembershipProbe {
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn ClusterConnector>,
}

impl NodeMembershipProbe {
    /// Create a probe
    pub fn new(runner: Arc<dyn CommandRunner>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self { runner, connector }
    }
}

#[async_trait]
impl MembershipProbe for NodeMembershipProbe {
    async fn agent_active(&self) -> bool {
        self.runner
            .succeeds("systemctl", &args(&["is-active", "--quiet", AGENT_UNIT]))
            .await
    }

    async fn cluster_member(&self, node: &str) -> Result<bool> {
        self.connector.connect().await?.node_ready(node).await
    }
}

/// The three signals consulted before the pipeline starts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirstBootStatus {
    /// The completion marker exists
    pub marker: bool,
    /// kubelet is running
    pub agent_active: bool,
    /// The node is a Ready cluster member
    pub member: bool,
}

impl FirstBootStatus {
    /// All three signals agree the node is bootstrapped
    pub fn is_bootstrapped(&self) -> bool {
        self.marker && self.agent_active && self.member
    }

    /// Marker present but the node does not look bootstrapped
    pub fn is_stale(&self) -> bool {
        self.marker && !self.is_bootstrapped()
    }
}

/// Gather the first-boot signals. Live checks are skipped when there is no marker.
pub async fn detect(
    store: &dyn StateStore,
    probe: &dyn MembershipProbe,
    node: &str,
) -> FirstBootStatus {
    let marker = store.is_complete(COMPLETION_STAGE);
    if !marker {
        debug!("No completion marker, treating as first boot");
        return FirstBootStatus::default();
    }

    let agent_active = probe.agent_active().await;
    let member = if agent_active {
        match probe.cluster_member(node).await {
            Ok(member) => member,
            Err(e) => {
                warn!(node = %node, error = %e, "Unable to confirm cluster membership");
                false
            }
        }
    } else {
        false
    };

    let status = FirstBootStatus {
        marker,
        agent_active,
        member,
    };
    if status.is_bootstrapped() {
        info!(node = %node, "Node already bootstrapped");
    } else {
        warn!(
            node = %node,
            agent_active = status.agent_active,
            member = status.member,
            "Completion marker present but node is not a healthy cluster member; use `bootline reset` to rebuild"
        );
    }
    status
}
