//! Control-plane and membership stages

use bootline_addons::NodeReadiness;
use bootline_cluster::ClusterJoinInfo;
use bootline_common::wait::{ConditionCheck, Observation};
use bootline_common::Result;
use tracing::info;

use super::StageContext;

/// Taint kubeadm puts on control-plane nodes
pub const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";

pub(super) async fn init_cluster(ctx: &StageContext) -> Result<()> {
    let outcome = ctx.bootstrapper.init().await?;
    info!(
        adopted = outcome.adopted,
        endpoint = %outcome.join_info.api_endpoint,
        "Control plane initialized, join artifacts published"
    );
    Ok(())
}

pub(super) async fn wait_api_server(ctx: &StageContext) -> Result<()> {
    let client = ctx.connector.connect().await?;
    let api = client.as_ref();
    let timeouts = &ctx.config.timeouts;
    let check = ConditionCheck::new(
        format!("API server {} healthy", ctx.config.cluster.api_endpoint),
        timeouts.api_server,
        timeouts.poll_interval,
    );
    ctx.waiter.wait_for(&check, move || api.api_healthy()).await?;
    Ok(())
}

pub(super) async fn configure_scheduling(ctx: &StageContext) -> Result<()> {
    let cluster = &ctx.config.cluster;
    if !cluster.is_single_control_plane() {
        info!(
            control_plane_count = cluster.control_plane_count,
            "Multiple control-plane nodes, keeping control-plane taint"
        );
        return Ok(());
    }

    let api = ctx.connector.connect().await?;
    let node = &ctx.config.identity.hostname;
    let removed = api.remove_node_taint(node, CONTROL_PLANE_TAINT).await?;
    if !removed {
        info!(node = %node, "Control-plane taint already absent");
    }
    Ok(())
}

pub(super) async fn wait_nodes_ready(ctx: &StageContext) -> Result<()> {
    let client = ctx.connector.connect().await?;
    let api = client.as_ref();
    let timeouts = &ctx.config.timeouts;
    let check = ConditionCheck::new("all nodes Ready", timeouts.node_ready, timeouts.poll_interval);
    ctx.waiter
        .wait_for(&check, || async move {
            api.nodes_ready().await.map(readiness_observation)
        })
        .await?;
    Ok(())
}

fn readiness_observation(nodes: NodeReadiness) -> Observation {
    let detail = format!("{}/{} nodes Ready", nodes.ready, nodes.total);
    if nodes.all_ready() {
        Observation::satisfied_with(detail)
    } else {
        Observation::pending(detail)
    }
}

pub(super) async fn join_cluster(ctx: &StageContext) -> Result<()> {
    let info = ClusterJoinInfo::load(&ctx.config.paths)?;
    ctx.bootstrapper.join(&info).await
}

pub(super) async fn wait_node_ready(ctx: &StageContext) -> Result<()> {
    let client = ctx.connector.connect().await?;
    let api = client.as_ref();
    let node = ctx.config.identity.hostname.as_str();
    let timeouts = &ctx.config.timeouts;
    let check = ConditionCheck::new(
        format!("node {node} Ready"),
        timeouts.node_ready,
        timeouts.poll_interval,
    );
    ctx.waiter.wait_for(&check, move || api.node_ready(node)).await?;
    Ok(())
}
