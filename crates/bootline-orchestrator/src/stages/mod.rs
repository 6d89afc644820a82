//! Stage definitions for each node role.
//!
//! Stage order is static per role. Each stage is a [`Step`] dispatched to a
//! handler in one of the submodules, sharing a single [`StageContext`].
//!
//! Primary:
//!
//! ```text
//! prepare-node, init-cluster, wait-api-server, configure-scheduling,
//! deploy-network, wait-nodes-ready, deploy-load-balancer, deploy-ingress,
//! publish-ready-signal, deploy-storage, deploy-monitoring,
//! deploy-management-ui, bootstrap-complete
//! ```
//!
//! Secondary:
//!
//! ```text
//! prepare-node, join-cluster, wait-node-ready, bootstrap-complete
//! ```
//!
//! Addon stages exist only for requested addons.

mod addons;
mod cluster;
mod complete;
mod node;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bootline_addons::{addon_spec, ChartInstaller};
use bootline_cluster::ClusterBootstrapper;
use bootline_common::command::CommandRunner;
use bootline_common::config::{AddonKind, BootConfig, Role};
use bootline_common::retry::RetryPolicy;
use bootline_common::wait::ConditionWaiter;
use bootline_common::Result;

pub use node::{comment_out_swap, HostLayout};

use crate::connector::ClusterConnector;
use crate::detect::{MembershipProbe, COMPLETION_STAGE};
use crate::pipeline::{Stage, StageAction};

/// Headroom added to a stage's inner waits to form its timeout
const STAGE_MARGIN: Duration = Duration::from_secs(120);

/// Upper bound for short, single-call stages
const SHORT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound for node preparation
const PREPARE_NODE_TIMEOUT: Duration = Duration::from_secs(900);

/// Budget for `kubeadm init`/`kubeadm join` themselves
const KUBEADM_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything a stage handler may touch
pub struct StageContext {
    /// Immutable boot configuration
    pub config: Arc<BootConfig>,
    /// Subprocess runner for host commands
    pub runner: Arc<dyn CommandRunner>,
    /// Cluster API access, available once the node has credentials
    pub connector: Arc<dyn ClusterConnector>,
    /// kubeadm init/join
    pub bootstrapper: Arc<ClusterBootstrapper>,
    /// Helm driver for chart-based addons
    pub charts: Arc<dyn ChartInstaller>,
    /// kubelet and membership checks
    pub membership: Arc<dyn MembershipProbe>,
    /// Host filesystem locations touched by node preparation
    pub host: HostLayout,
    /// Shared readiness gate
    pub waiter: ConditionWaiter,
    /// Retry policy for individual host commands and API calls
    pub retry: RetryPolicy,
}

/// One pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Hostname, swap, kernel modules, sysctl, container runtime
    PrepareNode,
    /// kubeadm init (or adoption) plus join artifact publication
    InitCluster,
    /// Gate on API server health
    WaitApiServer,
    /// Let workloads schedule on a lone control-plane node
    ConfigureScheduling,
    /// Deploy one addon
    DeployAddon(AddonKind),
    /// Gate on every registered node being Ready
    WaitNodesReady,
    /// Publish the cluster-ready ConfigMap secondaries wait for
    PublishReadySignal,
    /// Load join artifacts and kubeadm join
    JoinCluster,
    /// Gate on this node being Ready
    WaitNodeReady,
    /// Verify kubelet and write the completion marker
    BootstrapComplete,
}

impl Step {
    /// Stage identifier, also the marker file name
    pub fn name(&self) -> String {
        match self {
            Step::PrepareNode => "prepare-node".to_string(),
            Step::InitCluster => "init-cluster".to_string(),
            Step::WaitApiServer => "wait-api-server".to_string(),
            Step::ConfigureScheduling => "configure-scheduling".to_string(),
            Step::DeployAddon(kind) => format!("deploy-{kind}"),
            Step::WaitNodesReady => "wait-nodes-ready".to_string(),
            Step::PublishReadySignal => "publish-ready-signal".to_string(),
            Step::JoinCluster => "join-cluster".to_string(),
            Step::WaitNodeReady => "wait-node-ready".to_string(),
            Step::BootstrapComplete => COMPLETION_STAGE.to_string(),
        }
    }

    fn timeout(&self, config: &BootConfig) -> Duration {
        let t = &config.timeouts;
        match self {
            Step::PrepareNode => PREPARE_NODE_TIMEOUT,
            Step::InitCluster => t.api_server + KUBEADM_TIMEOUT + STAGE_MARGIN,
            Step::WaitApiServer => t.api_server + STAGE_MARGIN,
            Step::ConfigureScheduling | Step::PublishReadySignal => SHORT_STAGE_TIMEOUT,
            Step::DeployAddon(kind) => addon_spec(*kind, &config.cluster).max_wait + SHORT_STAGE_TIMEOUT,
            Step::WaitNodesReady | Step::WaitNodeReady | Step::BootstrapComplete => {
                t.node_ready + STAGE_MARGIN
            }
            Step::JoinCluster => t.api_server + t.cluster_ready + KUBEADM_TIMEOUT,
        }
    }

    /// Stages that make a single cluster API call retry it as a whole
    fn retry(&self) -> RetryPolicy {
        match self {
            Step::ConfigureScheduling | Step::PublishReadySignal => RetryPolicy::default(),
            _ => RetryPolicy::once(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Stage ordering for the primary node
pub fn primary_steps(addons: &[AddonKind]) -> Vec<Step> {
    let mut steps = vec![
        Step::PrepareNode,
        Step::InitCluster,
        Step::WaitApiServer,
        Step::ConfigureScheduling,
    ];

    let mut signal_published = false;
    for kind in AddonKind::ALL.into_iter().filter(|k| addons.contains(k)) {
        if !signal_published && !gates_ready_signal(kind) {
            steps.push(Step::PublishReadySignal);
            signal_published = true;
        }
        steps.push(Step::DeployAddon(kind));
        if kind == AddonKind::NetworkPlugin {
            steps.push(Step::WaitNodesReady);
        }
    }
    if !signal_published {
        steps.push(Step::PublishReadySignal);
    }

    steps.push(Step::BootstrapComplete);
    steps
}

/// Stage ordering for a joining node
pub fn secondary_steps() -> Vec<Step> {
    vec![
        Step::PrepareNode,
        Step::JoinCluster,
        Step::WaitNodeReady,
        Step::BootstrapComplete,
    ]
}

/// Addons that must be ready before secondaries may join
fn gates_ready_signal(kind: AddonKind) -> bool {
    matches!(
        kind,
        AddonKind::NetworkPlugin | AddonKind::LoadBalancer | AddonKind::Ingress
    )
}

/// Steps for this node's role
pub fn steps_for(config: &BootConfig) -> Vec<Step> {
    match config.identity.role {
        Role::Primary => primary_steps(&config.addons),
        Role::Secondary => secondary_steps(),
    }
}

/// Build the pipeline stages for this node's role
pub fn build_stages(ctx: Arc<StageContext>) -> Vec<Stage> {
    steps_for(&ctx.config)
        .into_iter()
        .map(|step| {
            Stage::new(
                step.name(),
                StepAction {
                    ctx: ctx.clone(),
                    step,
                },
            )
            .with_timeout(step.timeout(&ctx.config))
            .with_retry(step.retry())
        })
        .collect()
}

/// Binds a [`Step`] to the shared context
struct StepAction {
    ctx: Arc<StageContext>,
    step: Step,
}

#[async_trait]
impl StageAction for StepAction {
    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref();
        match self.step {
            Step::PrepareNode => node::prepare_node(ctx).await,
            Step::InitCluster => cluster::init_cluster(ctx).await,
            Step::WaitApiServer => cluster::wait_api_server(ctx).await,
            Step::ConfigureScheduling => cluster::configure_scheduling(ctx).await,
            Step::DeployAddon(kind) => addons::deploy_addon(ctx, kind).await,
            Step::WaitNodesReady => cluster::wait_nodes_ready(ctx).await,
            Step::PublishReadySignal => addons::publish_ready_signal(ctx).await,
            Step::JoinCluster => cluster::join_cluster(ctx).await,
            Step::WaitNodeReady => cluster::wait_node_ready(ctx).await,
            Step::BootstrapComplete => complete::bootstrap_complete(ctx).await,
        }
    }
}
