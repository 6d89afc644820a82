//! Shared Kubernetes utilities using kube-rs
//!
//! Provides the kubectl-equivalent operations the orchestrator needs
//! (server-side apply, namespace creation, readiness inspection) as typed
//! client calls instead of shelling out.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::Value;
use tracing::trace;

use crate::{Error, Result, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let kubeconfig_data = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::configuration_at(kubeconfig, format!("failed to read kubeconfig: {e}"))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig_data, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::configuration_at(kubeconfig, format!("failed to load kubeconfig: {e}"))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::fatal("create_client", format!("failed to create client: {e}")))
}

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed document
    pub value: Value,
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Namespace, if the resource is namespaced
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

/// Extract apply metadata from a parsed manifest document
pub fn parse_manifest(value: Value) -> Result<ManifestMetadata> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::configuration("manifest missing apiVersion"))?
        .to_string();

    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::configuration("manifest missing kind"))?
        .to_string();

    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::configuration(format!("{kind} manifest missing metadata.name")))?
        .to_string();

    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    let api_resource = build_api_resource(&api_version, &kind);

    Ok(ManifestMetadata {
        value,
        kind,
        name,
        namespace,
        api_resource,
    })
}

/// Apply a parsed manifest using server-side apply.
///
/// Apply is declarative and idempotent, so re-applying after a partial
/// failure is always safe.
pub async fn apply_manifest(client: &Client, manifest: Value) -> Result<()> {
    let metadata = parse_manifest(manifest)?;
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let api: Api<DynamicObject> = match &metadata.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &metadata.api_resource),
        None => Api::all_with(client.clone(), &metadata.api_resource),
    };

    api.patch(&metadata.name, &params, &Patch::Apply(&metadata.value))
        .await?;

    trace!(kind = %metadata.kind, name = %metadata.name, namespace = ?metadata.namespace, "applied manifest");
    Ok(())
}

/// Ensure a namespace exists (idempotent).
///
/// Uses server-side apply so it never fails on "already exists".
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use bootline_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Kinds whose plural is not derivable by the simple rules below
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("prometheus", "prometheuses"),
];

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
///
/// Namespaces and CRDs must exist before anything that lives in or
/// instantiates them; RBAC before workloads that run under it.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 8,
    }
}

/// Sort parsed documents so dependencies are applied first
pub fn sort_for_apply(docs: &mut [Value]) {
    docs.sort_by_key(|doc| kind_priority(doc.get("kind").and_then(Value::as_str).unwrap_or("")));
}

/// Rollout progress of a Deployment or DaemonSet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    /// Replicas (or scheduled pods) the controller wants
    pub desired: i32,
    /// Replicas running the current template
    pub updated: i32,
    /// Replicas passing readiness
    pub ready: i32,
    /// Replicas available to serve
    pub available: i32,
    /// Whether the controller has observed the latest spec
    pub observed_current: bool,
}

impl RolloutStatus {
    /// All desired replicas are updated, ready and available.
    ///
    /// A controller that has not yet observed the latest generation, or a
    /// DaemonSet that wants zero pods, is not complete.
    pub fn is_complete(&self) -> bool {
        self.observed_current
            && self.desired > 0
            && self.updated >= self.desired
            && self.ready >= self.desired
            && self.available >= self.desired
    }

    /// Diagnostic snapshot, e.g. `"ready 1/3, updated 3/3, available 1/3"`
    pub fn summary(&self) -> String {
        format!(
            "ready {}/{}, updated {}/{}, available {}/{}",
            self.ready, self.desired, self.updated, self.desired, self.available, self.desired
        )
    }
}

/// Rollout status of a Deployment
pub fn deployment_rollout(deployment: &Deployment) -> RolloutStatus {
    let generation = deployment.metadata.generation.unwrap_or_default();
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    match &deployment.status {
        Some(status) => RolloutStatus {
            desired,
            updated: status.updated_replicas.unwrap_or_default(),
            ready: status.ready_replicas.unwrap_or_default(),
            available: status.available_replicas.unwrap_or_default(),
            observed_current: status.observed_generation.unwrap_or_default() >= generation,
        },
        None => RolloutStatus {
            desired,
            ..Default::default()
        },
    }
}

/// Rollout status of a DaemonSet
pub fn daemonset_rollout(daemonset: &DaemonSet) -> RolloutStatus {
    let generation = daemonset.metadata.generation.unwrap_or_default();
    match &daemonset.status {
        Some(status) => RolloutStatus {
            desired: status.desired_number_scheduled,
            updated: status.updated_number_scheduled.unwrap_or_default(),
            ready: status.number_ready,
            available: status.number_available.unwrap_or_default(),
            observed_current: status.observed_generation.unwrap_or_default() >= generation,
        },
        None => RolloutStatus::default(),
    }
}

/// Whether a node reports the Ready condition as True
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Treat a 404 as "absent" rather than an error
pub fn not_found_as_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}
