//! bootstrap-complete: the marker first-boot detection keys on

use bootline_common::wait::ConditionCheck;
use bootline_common::{Error, Result};
use tracing::info;

use super::StageContext;
use crate::detect::AGENT_UNIT;

/// Waits for kubelet to be active. The pipeline writes this stage's marker,
/// which is only meaningful once the node can actually serve as a member.
pub(super) async fn bootstrap_complete(ctx: &StageContext) -> Result<()> {
    let membership = ctx.membership.as_ref();
    let timeouts = &ctx.config.timeouts;
    let check = ConditionCheck::new(
        format!("{AGENT_UNIT} active"),
        timeouts.node_ready,
        timeouts.poll_interval,
    );
    ctx.waiter
        .wait_for(&check, move || async move {
            Ok::<_, Error>(membership.agent_active().await)
        })
        .await?;

    info!(
        node = %ctx.config.identity.hostname,
        role = %ctx.config.identity.role,
        "Node bootstrap verified"
    );
    Ok(())
}
