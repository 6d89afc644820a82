//! Readiness contracts
//!
//! Two halves: [`validate_targets`] proves, before anything is applied,
//! that every readiness target names a resource the pinned version really
//! installs; [`observe_targets`] is the poll the deployer hands to the
//! `ConditionWaiter`.

use bootline_common::wait::Observation;
use bootline_common::{Error, Result};
use serde_json::Value;

use crate::addon::{AddonSpec, ReadinessTarget};
use crate::api::ClusterApi;

/// Check every readiness target against the rendered documents.
///
/// Documents without `metadata.namespace` are treated as living in the
/// addon's namespace, which is how `helm template --namespace` renders them.
pub fn validate_targets(spec: &AddonSpec, documents: &[Value]) -> Result<()> {
    for target in &spec.readiness {
        let found = documents
            .iter()
            .any(|doc| document_matches(doc, target, &spec.namespace));
        if !found {
            return Err(Error::configuration(format!(
                "addon {} {}: readiness target {target} is not installed by this version",
                spec.name, spec.version
            )));
        }
    }
    Ok(())
}

fn document_matches(doc: &Value, target: &ReadinessTarget, default_namespace: &str) -> bool {
    let kind = doc.get("kind").and_then(Value::as_str);
    let name = doc.pointer("/metadata/name").and_then(Value::as_str);
    if kind != Some(target.kind()) || name != Some(target.name()) {
        return false;
    }
    match target.namespace() {
        Some(expected) => {
            let namespace = doc
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or(default_namespace);
            namespace == expected
        }
        None => true,
    }
}

/// Observe one target
pub async fn observe_target(api: &dyn ClusterApi, target: &ReadinessTarget) -> Result<Observation> {
    let status = match target {
        ReadinessTarget::Deployment { namespace, name } => {
            api.deployment_status(namespace, name).await?
        }
        ReadinessTarget::DaemonSet { namespace, name } => {
            api.daemonset_status(namespace, name).await?
        }
        ReadinessTarget::CrdEstablished { name } => {
            return Ok(if api.crd_established(name).await? {
                Observation::satisfied_with(format!("{target}: established"))
            } else {
                Observation::pending(format!("{target}: not established"))
            });
        }
    };

    Ok(match status {
        None => Observation::pending(format!("{target}: not found")),
        Some(status) if status.is_complete() => {
            Observation::satisfied_with(format!("{target}: {}", status.summary()))
        }
        Some(status) => Observation::pending(format!("{target}: {}", status.summary())),
    })
}

/// Observe all targets in order, stopping at the first one not yet ready
pub async fn observe_targets(api: &dyn ClusterApi, targets: &[ReadinessTarget]) -> Result<Observation> {
    for target in targets {
        let observation = observe_target(api, target).await?;
        if !observation.satisfied {
            return Ok(observation);
        }
    }
    Ok(Observation::satisfied_with(format!(
        "{} readiness targets ready",
        targets.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockClusterApi;
    use crate::catalog::addon_spec;
    use bootline_common::config::{AddonKind, ClusterSettings};
    use bootline_common::kube_utils::RolloutStatus;
    use bootline_common::yaml::parse_documents;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            api_endpoint: "10.0.0.10:6443".to_string(),
            control_plane_join: false,
            control_plane_count: 1,
            pod_network_cidr: "10.244.0.0/16".to_string(),
            kubernetes_version: None,
            load_balancer_range: None,
            admin_user: None,
        }
    }

    fn rollout(desired: i32, ready: i32) -> RolloutStatus {
        RolloutStatus {
            desired,
            updated: desired,
            ready,
            available: ready,
            observed_current: true,
        }
    }

    #[test]
    fn renamed_resource_fails_validation() {
        let spec = addon_spec(AddonKind::NetworkPlugin, &settings());
        // Pre-0.20 flannel releases named the DaemonSet differently
        let docs = parse_documents(
            "kind: DaemonSet\nmetadata:\n  name: kube-flannel-ds-amd64\n  namespace: kube-flannel\n",
        )
        .unwrap();

        let err = validate_targets(&spec, &docs).unwrap_err();
        assert_eq!(err.kind(), bootline_common::ErrorKind::Configuration);
        let msg = err.to_string();
        assert!(msg.contains("flannel v0.26.1"), "{msg}");
        assert!(msg.contains("DaemonSet kube-flannel/kube-flannel-ds"), "{msg}");
    }

    #[test]
    fn namespace_defaults_to_addon_namespace() {
        let spec = addon_spec(AddonKind::Ingress, &settings());
        let docs = parse_documents(
            "kind: Deployment\nmetadata:\n  name: ingress-nginx-controller\n",
        )
        .unwrap();
        validate_targets(&spec, &docs).unwrap();
    }

    #[test]
    fn wrong_namespace_fails_validation() {
        let spec = addon_spec(AddonKind::Ingress, &settings());
        let docs = parse_documents(
            "kind: Deployment\nmetadata:\n  name: ingress-nginx-controller\n  namespace: default\n",
        )
        .unwrap();
        assert!(validate_targets(&spec, &docs).is_err());
    }

    #[tokio::test]
    async fn partial_rollout_reports_counts() {
        let mut api = MockClusterApi::new();
        api.expect_daemonset_status()
            .returning(|_, _| Ok(Some(rollout(3, 2))));

        let target = ReadinessTarget::daemonset("kube-flannel", "kube-flannel-ds");
        let obs = observe_target(&api, &target).await.unwrap();
        assert!(!obs.satisfied);
        assert_eq!(
            obs.detail.as_deref(),
            Some("DaemonSet kube-flannel/kube-flannel-ds: ready 2/3, updated 3/3, available 2/3")
        );
    }

    #[tokio::test]
    async fn missing_resource_is_pending_not_an_error() {
        let mut api = MockClusterApi::new();
        api.expect_deployment_status().returning(|_, _| Ok(None));

        let target = ReadinessTarget::deployment("metallb-system", "controller");
        let obs = observe_target(&api, &target).await.unwrap();
        assert!(!obs.satisfied);
        assert!(obs.detail.unwrap().ends_with("not found"));
    }

    #[tokio::test]
    async fn all_targets_must_be_ready() {
        let mut api = MockClusterApi::new();
        api.expect_crd_established().returning(|_| Ok(true));
        api.expect_deployment_status()
            .returning(|_, _| Ok(Some(rollout(1, 1))));
        api.expect_daemonset_status()
            .returning(|_, _| Ok(Some(rollout(1, 0))));

        let spec = addon_spec(AddonKind::LoadBalancer, &settings());
        let obs = observe_targets(&api, &spec.readiness).await.unwrap();
        assert!(!obs.satisfied);
        assert!(obs.detail.unwrap().contains("speaker"));
    }
}
