//! Cluster addons for bootline
//!
//! This crate provides:
//! - `AddonSpec` model and the pinned addon catalog
//! - Readiness contracts, validated against the pinned manifests before apply
//! - `ClusterApi` seam over kube-rs and `ChartInstaller` over helm
//! - Post-install fixups for single control-plane topologies
//! - `AddonDeployer`, which ties them together

pub mod addon;
pub mod api;
pub mod catalog;
pub mod deployer;
pub mod fixups;
pub mod helm;
pub mod readiness;

#[cfg(test)]
mod testing;

pub use addon::{AddonSpec, Fixup, ManifestSource, ReadinessTarget};
pub use api::{ClusterApi, KubeClusterApi, NodeReadiness};
pub use catalog::{addon_spec, catalog};
pub use deployer::AddonDeployer;
pub use helm::{ChartInstaller, ChartRelease, HelmCli};

#[cfg(test)]
pub use api::MockClusterApi;
#[cfg(test)]
pub use helm::MockChartInstaller;
