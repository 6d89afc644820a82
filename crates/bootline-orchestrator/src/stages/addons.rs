//! Addon stages and the cluster-ready signal

use bootline_addons::{addon_spec, AddonDeployer};
use bootline_common::config::AddonKind;
use bootline_common::{Result, READY_SIGNAL_CONFIGMAP, READY_SIGNAL_NAMESPACE};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::StageContext;

pub(super) async fn deploy_addon(ctx: &StageContext, kind: AddonKind) -> Result<()> {
    let spec = addon_spec(kind, &ctx.config.cluster);
    let api = ctx.connector.connect().await?;
    let deployer = AddonDeployer::new(api, ctx.charts.clone(), ctx.config.clone())
        .with_retry(ctx.retry)
        .with_waiter(ctx.waiter.clone());

    let waited = deployer.deploy(&spec).await?;
    info!(
        addon = %spec.label(),
        readiness_secs = waited.as_secs_f64(),
        "Addon {} ready",
        spec.name
    );
    Ok(())
}

pub(super) async fn publish_ready_signal(ctx: &StageContext) -> Result<()> {
    let api = ctx.connector.connect().await?;
    let document = ready_signal(&ctx.config.identity.hostname, &ctx.config.addons);
    api.apply(&document).await?;
    info!(
        configmap = %format!("{READY_SIGNAL_NAMESPACE}/{READY_SIGNAL_CONFIGMAP}"),
        "Published cluster-ready signal"
    );
    Ok(())
}

/// ConfigMap secondaries poll for before joining
fn ready_signal(node: &str, addons: &[AddonKind]) -> Value {
    let addons: Vec<&str> = addons.iter().map(AddonKind::as_str).collect();
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": READY_SIGNAL_CONFIGMAP,
            "namespace": READY_SIGNAL_NAMESPACE,
        },
        "data": {
            "primary": node,
            "addons": addons.join(","),
            "readyAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bootline_common::config::Role;
    use bootline_common::kube_utils::RolloutStatus;
    use bootline_common::ErrorKind;

    use crate::testing::{context_with, MockClusterApi};

    const FLANNEL: &str = "\
apiVersion: v1
kind: Namespace
metadata:
  name: kube-flannel
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kube-flannel-ds
  namespace: kube-flannel
";

    fn rolled_out() -> RolloutStatus {
        RolloutStatus {
            desired: 1,
            updated: 1,
            ready: 1,
            available: 1,
            observed_current: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_addon_is_applied_then_gated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut api = MockClusterApi::new();
        api.expect_ensure_namespace()
            .withf(|ns| ns == "kube-flannel")
            .returning(|_| Ok(()));
        api.expect_apply().times(2).returning(|_| Ok(()));
        api.expect_daemonset_status()
            .withf(|ns, name| ns == "kube-flannel" && name == "kube-flannel-ds")
            .returning(|_, _| Ok(Some(rolled_out())));

        let ctx = context_with(Role::Primary, tmp.path(), |parts| {
            std::fs::create_dir_all(&parts.config.paths.manifest_dir).unwrap();
            std::fs::write(
                parts.config.paths.manifest("kube-flannel-v0.26.1.yaml"),
                FLANNEL,
            )
            .unwrap();
            parts.api = Arc::new(api);
        });

        deploy_addon(&ctx, AddonKind::NetworkPlugin).await.unwrap();
    }

    #[tokio::test]
    async fn missing_pinned_manifest_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut api = MockClusterApi::new();
        api.expect_ensure_namespace().returning(|_| Ok(()));
        api.expect_apply().times(0);

        let ctx = context_with(Role::Primary, tmp.path(), |parts| {
            parts.api = Arc::new(api);
        });

        let err = deploy_addon(&ctx, AddonKind::Ingress).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn ready_signal_is_the_configmap_secondaries_poll() {
        let tmp = tempfile::tempdir().unwrap();
        let mut api = MockClusterApi::new();
        api.expect_apply()
            .withf(|doc| {
                doc["kind"] == "ConfigMap"
                    && doc["metadata"]["name"] == READY_SIGNAL_CONFIGMAP
                    && doc["metadata"]["namespace"] == READY_SIGNAL_NAMESPACE
                    && doc["data"]["primary"] == "node-0"
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context_with(Role::Primary, tmp.path(), |parts| {
            parts.api = Arc::new(api);
        });
        publish_ready_signal(&ctx).await.unwrap();
    }

    #[test]
    fn ready_signal_lists_requested_addons() {
        let doc = ready_signal("node-0", &[AddonKind::NetworkPlugin, AddonKind::Ingress]);
        assert_eq!(doc["data"]["addons"], "network,ingress");
    }
}
