//! Addon model
//!
//! An [`AddonSpec`] is declared statically per addon version and describes
//! where the manifests come from, which resources prove the addon is ready,
//! and which one-time fixups the deployment topology needs afterwards.

use std::fmt;
use std::time::Duration;

use bootline_common::config::AddonKind;

/// Where an addon's resources come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestSource {
    /// Multi-document release manifest, relative to the manifest directory
    Manifest {
        /// File name
        file: String,
    },
    /// Helm chart archive, relative to the manifest directory
    Chart {
        /// Helm release name
        release: String,
        /// Chart archive file name
        chart: String,
        /// Optional values file name
        values: Option<String>,
    },
}

/// A resource whose state proves the addon is ready.
///
/// Names must match what the pinned version actually installs; they are
/// checked against the rendered manifests before anything is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadinessTarget {
    /// Deployment rollout complete
    Deployment {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
    },
    /// DaemonSet ready count equals desired count
    DaemonSet {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
    },
    /// CustomResourceDefinition reports Established
    CrdEstablished {
        /// CRD name (`plural.group`)
        name: String,
    },
}

impl ReadinessTarget {
    /// Deployment target
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Deployment {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// DaemonSet target
    pub fn daemonset(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DaemonSet {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// CRD target
    pub fn crd(name: impl Into<String>) -> Self {
        Self::CrdEstablished { name: name.into() }
    }

    /// Kind as it appears in manifests
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deployment { .. } => "Deployment",
            Self::DaemonSet { .. } => "DaemonSet",
            Self::CrdEstablished { .. } => "CustomResourceDefinition",
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        match self {
            Self::Deployment { name, .. }
            | Self::DaemonSet { name, .. }
            | Self::CrdEstablished { name } => name,
        }
    }

    /// Namespace, for namespaced targets
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Deployment { namespace, .. } | Self::DaemonSet { namespace, .. } => {
                Some(namespace)
            }
            Self::CrdEstablished { .. } => None,
        }
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{} {}", self.kind(), self.name()),
        }
    }
}

/// One-time corrections applied after an addon reports ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fixup {
    /// Drop `node.kubernetes.io/exclude-from-external-load-balancers` from
    /// control-plane nodes. Only on single control-plane clusters, where
    /// the control plane must also serve load-balanced traffic.
    AllowControlPlaneLoadBalancing,
    /// Hand the configured address range to the load balancer
    ConfigureAddressPool {
        /// Namespace of the load balancer's custom resources
        namespace: String,
        /// Pool and advertisement name
        pool: String,
    },
    /// Mark a StorageClass as the cluster default
    DefaultStorageClass {
        /// StorageClass name
        name: String,
    },
}

impl fmt::Display for Fixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowControlPlaneLoadBalancing => {
                f.write_str("allow load balancing on control-plane nodes")
            }
            Self::ConfigureAddressPool { namespace, pool } => {
                write!(f, "configure address pool {namespace}/{pool}")
            }
            Self::DefaultStorageClass { name } => write!(f, "make {name} the default StorageClass"),
        }
    }
}

/// Declaration of one pinned addon
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddonSpec {
    /// Which capability this addon provides
    pub kind: AddonKind,
    /// Upstream project name
    pub name: String,
    /// Pinned upstream version
    pub version: String,
    /// Namespace the addon installs into
    pub namespace: String,
    /// Manifest or chart
    pub source: ManifestSource,
    /// Resources checked after apply
    pub readiness: Vec<ReadinessTarget>,
    /// Upper bound on the readiness wait
    pub max_wait: Duration,
    /// Post-install fixups, in order
    pub fixups: Vec<Fixup>,
}

impl AddonSpec {
    /// `name@version`, used in logs and errors
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}
