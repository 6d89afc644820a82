//! Boot-time configuration
//!
//! Everything the orchestrator needs to know about the node and the cluster
//! it belongs to, read once at startup and passed explicitly to every
//! component. Nothing here is mutated after validation.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result, API_SERVER_PORT};

/// Default directory for stage completion markers
pub const DEFAULT_STATE_DIR: &str = "/var/lib/bootline/state";
/// Default persistent log file
pub const DEFAULT_LOG_FILE: &str = "/var/log/bootline.log";
/// Default directory for join artifacts
pub const DEFAULT_JOIN_DIR: &str = "/var/lib/bootline/join";
/// Default directory holding pinned addon manifests and chart values
pub const DEFAULT_MANIFEST_DIR: &str = "/opt/bootline/manifests";
/// Admin kubeconfig written by kubeadm on control-plane nodes
pub const DEFAULT_ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
/// Kubelet kubeconfig written by kubeadm once a node has joined
pub const DEFAULT_KUBELET_KUBECONFIG: &str = "/etc/kubernetes/kubelet.conf";
/// Home directory of the root user
pub const DEFAULT_ROOT_HOME: &str = "/root";
/// Parent of regular users' home directories
pub const DEFAULT_USER_HOME_BASE: &str = "/home";
/// Default pod network CIDR (matches the pinned network plugin's default)
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";

/// File name of the join-command script inside the join directory
pub const JOIN_COMMAND_FILE: &str = "join-command.sh";
/// File name of the admin credentials inside the join directory
pub const ADMIN_CREDENTIALS_FILE: &str = "admin.conf";
/// File name of the certificate encryption key inside the join directory
pub const CERTIFICATE_KEY_FILE: &str = "certificate-key";

/// Role of this node in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initializes the control plane and deploys addons
    Primary,
    /// Joins the cluster created by the primary
    Secondary,
}

impl Role {
    /// Lowercase name used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "control-plane" | "server" => Ok(Role::Primary),
            "secondary" | "worker" | "agent" => Ok(Role::Secondary),
            other => Err(Error::configuration(format!(
                "unknown node role {other:?} (expected primary or secondary)"
            ))),
        }
    }
}

/// Cluster capabilities installed after the control plane is up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddonKind {
    /// Pod network (CNI)
    NetworkPlugin,
    /// Bare-metal LoadBalancer service implementation
    LoadBalancer,
    /// Ingress controller
    Ingress,
    /// Default dynamic storage provisioner
    Storage,
    /// Metrics and dashboards
    Monitoring,
    /// Web management UI
    ManagementUi,
}

impl AddonKind {
    /// Every addon, in deployment order
    pub const ALL: [AddonKind; 6] = [
        AddonKind::NetworkPlugin,
        AddonKind::LoadBalancer,
        AddonKind::Ingress,
        AddonKind::Storage,
        AddonKind::Monitoring,
        AddonKind::ManagementUi,
    ];

    /// Name used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonKind::NetworkPlugin => "network",
            AddonKind::LoadBalancer => "load-balancer",
            AddonKind::Ingress => "ingress",
            AddonKind::Storage => "storage",
            AddonKind::Monitoring => "monitoring",
            AddonKind::ManagementUi => "management-ui",
        }
    }
}

impl fmt::Display for AddonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddonKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AddonKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| Error::configuration(format!("unknown addon {s:?}")))
    }
}

/// Parse a comma-separated addon list (`"network,ingress"`), keeping
/// deployment order regardless of the order given.
///
/// The network plugin is mandatory: without it no node ever becomes Ready.
pub fn parse_addons(list: &str) -> Result<Vec<AddonKind>> {
    let mut addons = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(AddonKind::from_str)
        .collect::<Result<Vec<_>>>()?;
    addons.sort();
    addons.dedup();
    if !addons.contains(&AddonKind::NetworkPlugin) {
        return Err(Error::configuration(
            "addon list must include the network plugin",
        ));
    }
    Ok(addons)
}

/// Who this node is. Set once from boot-time configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Node hostname, also used as the Kubernetes node name
    pub hostname: String,
    /// Primary or secondary
    pub role: Role,
    /// Address on the cluster network
    pub private_ip: IpAddr,
    /// Publicly reachable address, if different
    pub external_ip: Option<IpAddr>,
    /// Position of this node in the fleet (0 for the primary)
    pub node_index: u32,
}

/// Cluster-wide settings shared by every node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSettings {
    /// `host:port` of the control-plane API
    pub api_endpoint: String,
    /// Secondary joins as an additional control-plane node
    pub control_plane_join: bool,
    /// Number of control-plane nodes in the final topology
    pub control_plane_count: u32,
    /// Pod network CIDR handed to kubeadm
    pub pod_network_cidr: String,
    /// Kubernetes version for kubeadm, if pinned
    pub kubernetes_version: Option<String>,
    /// Address range handed to the load balancer (`a.b.c.d-e.f.g.h` or CIDR)
    pub load_balancer_range: Option<String>,
    /// Local user that receives a copy of the admin kubeconfig
    pub admin_user: Option<String>,
}

impl ClusterSettings {
    /// A single control-plane node serves all traffic itself
    pub fn is_single_control_plane(&self) -> bool {
        self.control_plane_count <= 1
    }
}

/// Filesystem locations used by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootPaths {
    /// Stage marker directory
    pub state_dir: PathBuf,
    /// Persistent log file
    pub log_file: PathBuf,
    /// Join artifact directory
    pub join_dir: PathBuf,
    /// Pinned manifests and chart values
    pub manifest_dir: PathBuf,
    /// Admin kubeconfig generated by kubeadm
    pub admin_kubeconfig: PathBuf,
    /// Kubelet kubeconfig, present once this node is part of a cluster
    pub kubelet_kubeconfig: PathBuf,
    /// Root's home directory
    pub root_home: PathBuf,
    /// Parent of the admin user's home directory
    pub user_home_base: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            join_dir: PathBuf::from(DEFAULT_JOIN_DIR),
            manifest_dir: PathBuf::from(DEFAULT_MANIFEST_DIR),
            admin_kubeconfig: PathBuf::from(DEFAULT_ADMIN_KUBECONFIG),
            kubelet_kubeconfig: PathBuf::from(DEFAULT_KUBELET_KUBECONFIG),
            root_home: PathBuf::from(DEFAULT_ROOT_HOME),
            user_home_base: PathBuf::from(DEFAULT_USER_HOME_BASE),
        }
    }
}

impl BootPaths {
    /// Join-command script
    pub fn join_command(&self) -> PathBuf {
        self.join_dir.join(JOIN_COMMAND_FILE)
    }

    /// Admin credentials shared with secondary nodes
    pub fn admin_credentials(&self) -> PathBuf {
        self.join_dir.join(ADMIN_CREDENTIALS_FILE)
    }

    /// Certificate encryption key for control-plane joins
    pub fn certificate_key(&self) -> PathBuf {
        self.join_dir.join(CERTIFICATE_KEY_FILE)
    }

    /// `~/.kube/config` for root, or for `user` when given
    pub fn user_kubeconfig(&self, user: Option<&str>) -> PathBuf {
        let home = match user {
            Some(user) => self.user_home_base.join(user),
            None => self.root_home.clone(),
        };
        home.join(".kube").join("config")
    }

    /// Resolve a file relative to the manifest directory
    pub fn manifest(&self, file: impl AsRef<Path>) -> PathBuf {
        self.manifest_dir.join(file)
    }
}

/// Upper bounds for the long readiness gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootTimeouts {
    /// Wait for the primary's API server to become reachable
    pub api_server: Duration,
    /// Wait for the primary's cluster-ready sentinel
    pub cluster_ready: Duration,
    /// Wait for nodes to report Ready
    pub node_ready: Duration,
    /// Interval between polls
    pub poll_interval: Duration,
}

impl Default for BootTimeouts {
    fn default() -> Self {
        Self {
            api_server: Duration::from_secs(600),
            cluster_ready: Duration::from_secs(1800),
            node_ready: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Complete, validated orchestrator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootConfig {
    /// This node
    pub identity: NodeIdentity,
    /// The cluster
    pub cluster: ClusterSettings,
    /// Filesystem layout
    pub paths: BootPaths,
    /// Wait bounds
    pub timeouts: BootTimeouts,
    /// Addons to deploy (primary only), in deployment order
    pub addons: Vec<AddonKind>,
}

impl BootConfig {
    /// Check cross-field invariants. Every failure is a configuration error.
    pub fn validate(&self) -> Result<()> {
        validate_hostname(&self.identity.hostname)?;

        if self.cluster.control_plane_count == 0 {
            return Err(Error::configuration(
                "control plane count must be at least 1",
            ));
        }

        validate_endpoint(&self.cluster.api_endpoint)?;

        if self.identity.role == Role::Secondary
            && self.cluster.api_endpoint == default_api_endpoint(self.identity.private_ip)
        {
            return Err(Error::configuration(
                "secondary node needs the primary's API endpoint, not its own address",
            ));
        }

        if !self.cluster.pod_network_cidr.contains('/') {
            return Err(Error::configuration(format!(
                "pod network CIDR {:?} is not in CIDR notation",
                self.cluster.pod_network_cidr
            )));
        }

        if let Some(range) = &self.cluster.load_balancer_range {
            validate_address_range(range)?;
        }

        if !self.addons.contains(&AddonKind::NetworkPlugin) {
            return Err(Error::configuration(
                "addon list must include the network plugin",
            ));
        }

        Ok(())
    }
}

/// `private_ip:6443`, the endpoint a primary advertises
pub fn default_api_endpoint(private_ip: IpAddr) -> String {
    match private_ip {
        IpAddr::V4(ip) => format!("{ip}:{API_SERVER_PORT}"),
        IpAddr::V6(ip) => format!("[{ip}]:{API_SERVER_PORT}"),
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 63
        && hostname
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !hostname.starts_with('-')
        && !hostname.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "hostname {hostname:?} is not a valid Kubernetes node name"
        )))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let valid = endpoint
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "API endpoint {endpoint:?} must be host:port"
        )))
    }
}

fn validate_address_range(range: &str) -> Result<()> {
    let valid = if let Some((start, end)) = range.split_once('-') {
        start.trim().parse::<IpAddr>().is_ok() && end.trim().parse::<IpAddr>().is_ok()
    } else if let Some((ip, prefix)) = range.split_once('/') {
        ip.parse::<IpAddr>().is_ok() && prefix.parse::<u8>().map(|p| p <= 128).unwrap_or(false)
    } else {
        false
    };
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "load balancer range {range:?} must be start-end or CIDR"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary() -> BootConfig {
        let ip: IpAddr = "10.0.0.10".parse().unwrap();
        BootConfig {
            identity: NodeIdentity {
                hostname: "node-0".to_string(),
                role: Role::Primary,
                private_ip: ip,
                external_ip: None,
                node_index: 0,
            },
            cluster: ClusterSettings {
                api_endpoint: default_api_endpoint(ip),
                control_plane_join: false,
                control_plane_count: 1,
                pod_network_cidr: DEFAULT_POD_CIDR.to_string(),
                kubernetes_version: None,
                load_balancer_range: Some("10.0.0.240-10.0.0.250".to_string()),
                admin_user: Some("ops".to_string()),
            },
            paths: BootPaths::default(),
            timeouts: BootTimeouts::default(),
            addons: AddonKind::ALL.to_vec(),
        }
    }

    #[test]
    fn valid_primary_config_passes() {
        primary().validate().unwrap();
        assert_eq!(primary().cluster.api_endpoint, "10.0.0.10:6443");
    }

    #[test]
    fn secondary_pointing_at_itself_is_rejected() {
        let mut config = primary();
        config.identity.role = Role::Secondary;
        assert!(config.validate().is_err());

        config.cluster.api_endpoint = "10.0.0.1:6443".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn malformed_inputs_are_configuration_errors() {
        let mut config = primary();
        config.identity.hostname = "Node_0".to_string();
        assert!(config.validate().is_err());

        let mut config = primary();
        config.cluster.api_endpoint = "10.0.0.1".to_string();
        assert!(config.validate().is_err());

        let mut config = primary();
        config.cluster.load_balancer_range = Some("10.0.0.240".to_string());
        assert!(config.validate().is_err());

        let mut config = primary();
        config.cluster.control_plane_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn roles_parse_with_aliases() {
        assert_eq!("primary".parse::<Role>().unwrap(), Role::Primary);
        assert_eq!("Worker".parse::<Role>().unwrap(), Role::Secondary);
        assert!("leader".parse::<Role>().is_err());
    }

    #[test]
    fn addon_lists_are_normalized_to_deployment_order() {
        let addons = parse_addons("ingress, network,ingress").unwrap();
        assert_eq!(addons, vec![AddonKind::NetworkPlugin, AddonKind::Ingress]);

        assert!(parse_addons("ingress").is_err());
        assert!(parse_addons("network,mesh").is_err());
    }

    #[test]
    fn join_artifacts_live_under_join_dir() {
        let paths = BootPaths::default();
        assert_eq!(
            paths.join_command(),
            PathBuf::from("/var/lib/bootline/join/join-command.sh")
        );
        assert_eq!(
            paths.certificate_key(),
            PathBuf::from("/var/lib/bootline/join/certificate-key")
        );
        assert_eq!(
            paths.user_kubeconfig(Some("ops")),
            PathBuf::from("/home/ops/.kube/config")
        );
        assert_eq!(paths.user_kubeconfig(None), PathBuf::from("/root/.kube/config"));
    }

    #[test]
    fn single_control_plane_topology() {
        let mut settings = primary().cluster;
        assert!(settings.is_single_control_plane());
        settings.control_plane_count = 3;
        assert!(!settings.is_single_control_plane());
    }
}
