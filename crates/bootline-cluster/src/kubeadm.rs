//! kubeadm driver
//!
//! kubeadm has no API, so it is driven through [`CommandRunner`] with
//! explicit argument lists built from typed requests.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bootline_common::command::{args, CommandRunner};
use bootline_common::config::BootConfig;
use bootline_common::{Error, Result};
#[cfg(test)]
use mockall::automock;

use crate::join_info::JoinCommand;

const KUBEADM: &str = "kubeadm";

/// Parameters for `kubeadm init`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitRequest {
    /// Address the API server advertises
    pub advertise_address: IpAddr,
    /// Shared endpoint for all control-plane nodes
    pub control_plane_endpoint: String,
    /// Pod network CIDR
    pub pod_network_cidr: String,
    /// Kubernetes node name
    pub node_name: String,
    /// Extra SANs for the API server certificate
    pub cert_sans: Vec<String>,
    /// Pinned Kubernetes version
    pub kubernetes_version: Option<String>,
}

impl InitRequest {
    /// Build the init request for this node
    pub fn from_config(config: &BootConfig) -> Self {
        let identity = &config.identity;
        let mut cert_sans = vec![identity.private_ip.to_string(), identity.hostname.clone()];
        if let Some(external) = identity.external_ip {
            cert_sans.push(external.to_string());
        }
        Self {
            advertise_address: identity.private_ip,
            control_plane_endpoint: config.cluster.api_endpoint.clone(),
            pod_network_cidr: config.cluster.pod_network_cidr.clone(),
            node_name: identity.hostname.clone(),
            cert_sans,
            kubernetes_version: config.cluster.kubernetes_version.clone(),
        }
    }

    /// Argument list for `kubeadm`
    pub fn to_args(&self) -> Vec<String> {
        let mut argv = args(&["init", "--upload-certs"]);
        argv.extend([
            format!("--apiserver-advertise-address={}", self.advertise_address),
            format!("--control-plane-endpoint={}", self.control_plane_endpoint),
            format!("--pod-network-cidr={}", self.pod_network_cidr),
            format!("--node-name={}", self.node_name),
            format!("--apiserver-cert-extra-sans={}", self.cert_sans.join(",")),
        ]);
        if let Some(version) = &self.kubernetes_version {
            argv.push(format!("--kubernetes-version={version}"));
        }
        argv
    }
}

/// Extra parameters for joining as a control-plane node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneJoin {
    /// Key that decrypts the uploaded certificates
    pub certificate_key: String,
    /// Address this node's API server advertises
    pub advertise_address: IpAddr,
}

/// Parameters for `kubeadm join`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    /// Parsed join command published by the primary
    pub command: JoinCommand,
    /// Kubernetes node name
    pub node_name: String,
    /// Set when joining as an additional control-plane node
    pub control_plane: Option<ControlPlaneJoin>,
}

impl JoinRequest {
    /// Argument list for `kubeadm`
    pub fn to_args(&self) -> Vec<String> {
        let mut argv = vec![
            "join".to_string(),
            self.command.api_endpoint.clone(),
            format!("--token={}", self.command.token),
        ];
        argv.extend(
            self.command
                .ca_cert_hashes
                .iter()
                .map(|h| format!("--discovery-token-ca-cert-hash={h}")),
        );
        argv.push(format!("--node-name={}", self.node_name));
        if let Some(cp) = &self.control_plane {
            argv.push("--control-plane".to_string());
            argv.push(format!("--certificate-key={}", cp.certificate_key));
            argv.push(format!("--apiserver-advertise-address={}", cp.advertise_address));
        }
        argv
    }
}

/// Trait for the kubeadm operations bootline needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Kubeadm: Send + Sync {
    /// Initialize a new control plane
    async fn init(&self, request: &InitRequest) -> Result<()>;

    /// Join an existing cluster
    async fn join(&self, request: &JoinRequest) -> Result<()>;

    /// Create a bootstrap token and return the printed join command
    async fn create_join_command(&self) -> Result<JoinCommand>;

    /// Re-upload control-plane certificates and return the new certificate key
    async fn upload_certs(&self) -> Result<String>;
}

/// [`Kubeadm`] backed by the kubeadm binary
pub struct KubeadmCli {
    runner: Arc<dyn CommandRunner>,
}

impl KubeadmCli {
    /// Create a driver that runs kubeadm through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Kubeadm for KubeadmCli {
    async fn init(&self, request: &InitRequest) -> Result<()> {
        self.runner
            .run(KUBEADM, &request.to_args())
            .await
            .map(|_| ())
            .map_err(|e| e.into_fatal("kubeadm init"))
    }

    async fn join(&self, request: &JoinRequest) -> Result<()> {
        self.runner
            .run(KUBEADM, &request.to_args())
            .await
            .map(|_| ())
            .map_err(|e| e.into_fatal("kubeadm join"))
    }

    async fn create_join_command(&self) -> Result<JoinCommand> {
        let output = self
            .runner
            .run(KUBEADM, &args(&["token", "create", "--print-join-command"]))
            .await?;
        JoinCommand::parse(&output.stdout)
    }

    async fn upload_certs(&self) -> Result<String> {
        let output = self
            .runner
            .run(
                KUBEADM,
                &args(&["init", "phase", "upload-certs", "--upload-certs"]),
            )
            .await?;
        parse_certificate_key(&output.stdout)
    }
}

/// kubeadm prints the certificate key as the last line of its output
fn parse_certificate_key(stdout: &str) -> Result<String> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.len() == 64 && l.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
        .ok_or_else(|| {
            Error::fatal(
                "kubeadm upload-certs",
                "no certificate key found in kubeadm output",
            )
        })
}
