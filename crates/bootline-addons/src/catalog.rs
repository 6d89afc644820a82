//! Pinned addon catalog
//!
//! Versions are pinned by the image build, which drops the matching
//! manifests and chart archives into the manifest directory. Readiness
//! targets below are the resource names those exact versions install.

use std::time::Duration;

use bootline_common::config::{AddonKind, ClusterSettings};

use crate::addon::{AddonSpec, Fixup, ManifestSource, ReadinessTarget};

/// Flannel release
pub const FLANNEL_VERSION: &str = "v0.26.1";
/// MetalLB release
pub const METALLB_VERSION: &str = "v0.14.8";
/// ingress-nginx controller release
pub const INGRESS_NGINX_VERSION: &str = "v1.11.3";
/// local-path-provisioner release
pub const LOCAL_PATH_VERSION: &str = "v0.0.30";
/// kube-prometheus-stack chart version
pub const KUBE_PROMETHEUS_STACK_VERSION: &str = "65.1.1";
/// kubernetes-dashboard chart version
pub const DASHBOARD_VERSION: &str = "7.10.0";

/// Name of the MetalLB IPAddressPool and L2Advertisement bootline creates
pub const METALLB_POOL: &str = "bootline-pool";

const METALLB_NAMESPACE: &str = "metallb-system";

/// The pinned addon for `kind`, with fixups chosen for this topology
pub fn addon_spec(kind: AddonKind, cluster: &ClusterSettings) -> AddonSpec {
    match kind {
        AddonKind::NetworkPlugin => AddonSpec {
            kind,
            name: "flannel".to_string(),
            version: FLANNEL_VERSION.to_string(),
            namespace: "kube-flannel".to_string(),
            source: manifest(format!("kube-flannel-{FLANNEL_VERSION}.yaml")),
            readiness: vec![ReadinessTarget::daemonset("kube-flannel", "kube-flannel-ds")],
            max_wait: Duration::from_secs(300),
            fixups: vec![],
        },
        AddonKind::LoadBalancer => {
            let mut fixups = Vec::new();
            if cluster.is_single_control_plane() {
                fixups.push(Fixup::AllowControlPlaneLoadBalancing);
            }
            if cluster.load_balancer_range.is_some() {
                fixups.push(Fixup::ConfigureAddressPool {
                    namespace: METALLB_NAMESPACE.to_string(),
                    pool: METALLB_POOL.to_string(),
                });
            }
            AddonSpec {
                kind,
                name: "metallb".to_string(),
                version: METALLB_VERSION.to_string(),
                namespace: METALLB_NAMESPACE.to_string(),
                source: manifest(format!("metallb-native-{METALLB_VERSION}.yaml")),
                readiness: vec![
                    ReadinessTarget::crd("ipaddresspools.metallb.io"),
                    ReadinessTarget::crd("l2advertisements.metallb.io"),
                    ReadinessTarget::deployment(METALLB_NAMESPACE, "controller"),
                    ReadinessTarget::daemonset(METALLB_NAMESPACE, "speaker"),
                ],
                max_wait: Duration::from_secs(300),
                fixups,
            }
        }
        AddonKind::Ingress => AddonSpec {
            kind,
            name: "ingress-nginx".to_string(),
            version: INGRESS_NGINX_VERSION.to_string(),
            namespace: "ingress-nginx".to_string(),
            source: manifest(format!("ingress-nginx-{INGRESS_NGINX_VERSION}.yaml")),
            readiness: vec![ReadinessTarget::deployment(
                "ingress-nginx",
                "ingress-nginx-controller",
            )],
            max_wait: Duration::from_secs(300),
            fixups: vec![],
        },
        AddonKind::Storage => AddonSpec {
            kind,
            name: "local-path-provisioner".to_string(),
            version: LOCAL_PATH_VERSION.to_string(),
            namespace: "local-path-storage".to_string(),
            source: manifest(format!("local-path-storage-{LOCAL_PATH_VERSION}.yaml")),
            readiness: vec![ReadinessTarget::deployment(
                "local-path-storage",
                "local-path-provisioner",
            )],
            max_wait: Duration::from_secs(300),
            fixups: vec![Fixup::DefaultStorageClass {
                name: "local-path".to_string(),
            }],
        },
        AddonKind::Monitoring => AddonSpec {
            kind,
            name: "kube-prometheus-stack".to_string(),
            version: KUBE_PROMETHEUS_STACK_VERSION.to_string(),
            namespace: "monitoring".to_string(),
            source: chart(
                "kube-prometheus-stack",
                format!("kube-prometheus-stack-{KUBE_PROMETHEUS_STACK_VERSION}.tgz"),
                Some("kube-prometheus-stack-values.yaml"),
            ),
            readiness: vec![
                ReadinessTarget::deployment("monitoring", "kube-prometheus-stack-operator"),
                ReadinessTarget::deployment("monitoring", "kube-prometheus-stack-grafana"),
                ReadinessTarget::deployment(
                    "monitoring",
                    "kube-prometheus-stack-kube-state-metrics",
                ),
                ReadinessTarget::daemonset(
                    "monitoring",
                    "kube-prometheus-stack-prometheus-node-exporter",
                ),
            ],
            max_wait: Duration::from_secs(900),
            fixups: vec![],
        },
        AddonKind::ManagementUi => AddonSpec {
            kind,
            name: "kubernetes-dashboard".to_string(),
            version: DASHBOARD_VERSION.to_string(),
            namespace: "kubernetes-dashboard".to_string(),
            source: chart(
                "kubernetes-dashboard",
                format!("kubernetes-dashboard-{DASHBOARD_VERSION}.tgz"),
                None,
            ),
            // 7.x split the single dashboard Deployment into per-component ones
            readiness: [
                "kubernetes-dashboard-api",
                "kubernetes-dashboard-auth",
                "kubernetes-dashboard-web",
                "kubernetes-dashboard-metrics-scraper",
            ]
            .into_iter()
            .map(|name| ReadinessTarget::deployment("kubernetes-dashboard", name))
            .collect(),
            max_wait: Duration::from_secs(600),
            fixups: vec![],
        },
    }
}

/// Every requested addon, in deployment order
pub fn catalog(addons: &[AddonKind], cluster: &ClusterSettings) -> Vec<AddonSpec> {
    let mut kinds = addons.to_vec();
    kinds.sort();
    kinds.dedup();
    kinds
        .into_iter()
        .map(|kind| addon_spec(kind, cluster))
        .collect()
}

fn manifest(file: String) -> ManifestSource {
    ManifestSource::Manifest { file }
}

fn chart(release: &str, chart: String, values: Option<&str>) -> ManifestSource {
    ManifestSource::Chart {
        release: release.to_string(),
        chart,
        values: values.map(str::to_string),
    }
}
