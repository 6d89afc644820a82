//! Cluster bootstrap for bootline
//!
//! This crate provides:
//! - `Kubeadm` trait and the kubeadm CLI driver
//! - `ClusterJoinInfo` join artifacts (join-command script, admin credentials, certificate key)
//! - `JoinGate` probes a secondary node waits on before joining
//! - `ClusterBootstrapper` with the `init` (primary) and `join` (secondary) entry points

pub mod bootstrapper;
pub mod join_info;
pub mod kubeadm;
pub mod probe;

#[cfg(test)]
mod testing;

pub use bootstrapper::{ClusterBootstrapper, InitOutcome};
pub use join_info::{ClusterJoinInfo, JoinCommand};
pub use kubeadm::{InitRequest, JoinRequest, Kubeadm, KubeadmCli};
pub use probe::{ClusterJoinGate, JoinGate};

#[cfg(test)]
pub use kubeadm::MockKubeadm;
#[cfg(test)]
pub use probe::MockJoinGate;
