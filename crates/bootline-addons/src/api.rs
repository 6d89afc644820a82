//! Cluster API seam
//!
//! Every read and write bootline issues against the cluster goes through
//! [`ClusterApi`], so addon deployment and the pipeline stages can be
//! exercised against a mock.

use std::path::Path;

use async_trait::async_trait;
use bootline_common::kube_utils::{
    self, daemonset_rollout, deployment_rollout, node_is_ready, not_found_as_none, RolloutStatus,
};
use bootline_common::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Label carried by control-plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Annotation marking the default StorageClass
pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Ready vs total node counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeReadiness {
    /// Nodes reporting Ready=True
    pub ready: usize,
    /// All registered nodes
    pub total: usize,
}

impl NodeReadiness {
    /// At least one node is registered and all of them are Ready
    pub fn all_ready(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }
}

/// Operations bootline performs against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server answers requests
    async fn api_healthy(&self) -> Result<bool>;

    /// Create `name` if absent
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Server-side apply one manifest document
    async fn apply(&self, document: &Value) -> Result<()>;

    /// Rollout status of a Deployment, `None` if it does not exist yet
    async fn deployment_status(&self, namespace: &str, name: &str)
        -> Result<Option<RolloutStatus>>;

    /// Rollout status of a DaemonSet, `None` if it does not exist yet
    async fn daemonset_status(&self, namespace: &str, name: &str) -> Result<Option<RolloutStatus>>;

    /// CRD exists and reports Established
    async fn crd_established(&self, name: &str) -> Result<bool>;

    /// Ready counts across all nodes
    async fn nodes_ready(&self) -> Result<NodeReadiness>;

    /// Node `name` is registered and Ready
    async fn node_ready(&self, name: &str) -> Result<bool>;

    /// Names of nodes carrying the control-plane role label
    async fn control_plane_nodes(&self) -> Result<Vec<String>>;

    /// Remove `label` from `node`; absent labels are not an error
    async fn remove_node_label(&self, node: &str, label: &str) -> Result<()>;

    /// Remove taints with `key` from `node`. Returns whether anything changed.
    async fn remove_node_taint(&self, node: &str, key: &str) -> Result<bool>;

    /// Make `name` the only default StorageClass
    async fn set_default_storage_class(&self, name: &str) -> Result<()>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the admin kubeconfig
    pub async fn connect(kubeconfig: &Path) -> Result<Self> {
        Ok(Self::new(kube_utils::create_client(kubeconfig).await?))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn api_healthy(&self) -> Result<bool> {
        let version = self.client.apiserver_version().await?;
        debug!(version = %version.git_version, "API server reachable");
        Ok(true)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        kube_utils::ensure_namespace(&self.client, name).await
    }

    async fn apply(&self, document: &Value) -> Result<()> {
        kube_utils::apply_manifest(&self.client, document.clone()).await
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RolloutStatus>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(deployment_rollout))
    }

    async fn daemonset_status(&self, namespace: &str, name: &str) -> Result<Option<RolloutStatus>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(daemonset_rollout))
    }

    async fn crd_established(&self, name: &str) -> Result<bool> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let established = api
            .get_opt(name)
            .await?
            .and_then(|crd| crd.status)
            .and_then(|status| status.conditions)
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Established" && c.status == kube_utils::STATUS_TRUE)
            })
            .unwrap_or(false);
        Ok(established)
    }

    async fn nodes_ready(&self) -> Result<NodeReadiness> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(NodeReadiness {
            ready: nodes.items.iter().filter(|n| node_is_ready(n)).count(),
            total: nodes.items.len(),
        })
    }

    async fn node_ready(&self, name: &str) -> Result<bool> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some_and(|n| node_is_ready(&n)))
    }

    async fn control_plane_nodes(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(CONTROL_PLANE_LABEL))
            .await?;
        Ok(nodes
            .items
            .into_iter()
            .filter_map(|n| n.metadata.name)
            .collect())
    }

    async fn remove_node_label(&self, node: &str, label: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": { label: null } } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(node = %node, label = %label, "Removed node label");
        Ok(())
    }

    async fn remove_node_taint(&self, node: &str, key: &str) -> Result<bool> {
        let api: Api<Node> = Api::all(self.client.clone());
        let Some(current) = not_found_as_none(api.get(node).await)? else {
            return Err(Error::transient(
                "remove_node_taint",
                format!("node {node} is not registered yet"),
            ));
        };

        let taints = current
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default();
        let kept: Vec<_> = taints.iter().filter(|t| t.key != key).cloned().collect();
        if kept.len() == taints.len() {
            return Ok(false);
        }

        // Merge patch replaces lists wholesale
        let patch = json!({ "spec": { "taints": kept } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(node = %node, taint = %key, "Removed node taint");
        Ok(true)
    }

    async fn set_default_storage_class(&self, name: &str) -> Result<()> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let classes = api.list(&ListParams::default()).await?;

        if !classes.items.iter().any(|c| c.metadata.name.as_deref() == Some(name)) {
            return Err(Error::transient(
                "set_default_storage_class",
                format!("StorageClass {name} does not exist yet"),
            ));
        }

        for class in &classes.items {
            let Some(class_name) = class.metadata.name.as_deref() else {
                continue;
            };
            let is_default = class
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
                .is_some_and(|v| v == "true");
            let want_default = class_name == name;
            if is_default == want_default {
                continue;
            }
            let patch = json!({
                "metadata": { "annotations": { DEFAULT_CLASS_ANNOTATION: want_default.to_string() } }
            });
            api.patch(class_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        info!(storage_class = %name, "Default StorageClass set");
        Ok(())
    }
}
