//! Post-install fixups
//!
//! Topology-specific corrections applied once an addon reports ready. All
//! of them are idempotent, so a stage re-entered after a crash can run them
//! again safely.

use bootline_common::config::ClusterSettings;
use bootline_common::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::addon::Fixup;
use crate::api::ClusterApi;

/// Label that keeps a node out of external load balancer pools
pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

/// Apply one fixup
pub async fn run_fixup(api: &dyn ClusterApi, cluster: &ClusterSettings, fixup: &Fixup) -> Result<()> {
    match fixup {
        Fixup::AllowControlPlaneLoadBalancing => {
            // Speakers never announce from nodes carrying the label
            for node in api.control_plane_nodes().await? {
                api.remove_node_label(&node, EXCLUDE_FROM_LB_LABEL).await?;
            }
        }
        Fixup::ConfigureAddressPool { namespace, pool } => {
            let Some(range) = &cluster.load_balancer_range else {
                warn!(pool = %pool, "No load balancer address range configured, skipping pool");
                return Ok(());
            };
            for document in address_pool_documents(namespace, pool, range) {
                api.apply(&document).await?;
            }
        }
        Fixup::DefaultStorageClass { name } => {
            api.set_default_storage_class(name).await?;
        }
    }
    info!(fixup = %fixup, "Post-install fixup applied");
    Ok(())
}

/// IPAddressPool plus the L2Advertisement announcing it
pub fn address_pool_documents(namespace: &str, pool: &str, range: &str) -> [Value; 2] {
    [
        json!({
            "apiVersion": "metallb.io/v1beta1",
            "kind": "IPAddressPool",
            "metadata": { "name": pool, "namespace": namespace },
            "spec": { "addresses": [range] }
        }),
        json!({
            "apiVersion": "metallb.io/v1beta1",
            "kind": "L2Advertisement",
            "metadata": { "name": pool, "namespace": namespace },
            "spec": { "ipAddressPools": [pool] }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockClusterApi;
    use mockall::Sequence;

    fn settings(range: Option<&str>) -> ClusterSettings {
        ClusterSettings {
            api_endpoint: "10.0.0.10:6443".to_string(),
            control_plane_join: false,
            control_plane_count: 1,
            pod_network_cidr: "10.244.0.0/16".to_string(),
            kubernetes_version: None,
            load_balancer_range: range.map(str::to_string),
            admin_user: None,
        }
    }

    #[tokio::test]
    async fn exclusion_label_is_removed_from_every_control_plane_node() {
        let mut api = MockClusterApi::new();
        api.expect_control_plane_nodes()
            .returning(|| Ok(vec!["node-0".to_string()]));
        api.expect_remove_node_label()
            .withf(|node, label| node == "node-0" && label == EXCLUDE_FROM_LB_LABEL)
            .times(1)
            .returning(|_, _| Ok(()));

        run_fixup(&api, &settings(None), &Fixup::AllowControlPlaneLoadBalancing)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn address_pool_is_applied_before_advertisement() {
        let mut seq = Sequence::new();
        let mut api = MockClusterApi::new();
        api.expect_apply()
            .withf(|doc| doc["kind"] == "IPAddressPool" && doc["spec"]["addresses"][0] == "10.0.0.240-10.0.0.250")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_apply()
            .withf(|doc| doc["kind"] == "L2Advertisement")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let fixup = Fixup::ConfigureAddressPool {
            namespace: "metallb-system".to_string(),
            pool: "bootline-pool".to_string(),
        };
        run_fixup(&api, &settings(Some("10.0.0.240-10.0.0.250")), &fixup)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn address_pool_without_range_is_skipped() {
        let mut api = MockClusterApi::new();
        api.expect_apply().times(0);

        let fixup = Fixup::ConfigureAddressPool {
            namespace: "metallb-system".to_string(),
            pool: "bootline-pool".to_string(),
        };
        run_fixup(&api, &settings(None), &fixup).await.unwrap();
    }
}
