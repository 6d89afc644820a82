//! `bootline` command line
//!
//! Every node setting is a flag that falls back to the `BOOTLINE_*`
//! environment variable written by the first-boot configuration, so the
//! systemd unit can run plain `bootline`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bootline_addons::HelmCli;
use bootline_cluster::{ClusterBootstrapper, ClusterJoinGate, KubeadmCli};
use bootline_common::command::{CommandRunner, SystemCommandRunner};
use bootline_common::config::{
    default_api_endpoint, parse_addons, BootConfig, BootPaths, BootTimeouts, ClusterSettings,
    NodeIdentity, Role, DEFAULT_JOIN_DIR, DEFAULT_LOG_FILE, DEFAULT_MANIFEST_DIR,
    DEFAULT_POD_CIDR, DEFAULT_STATE_DIR,
};
use bootline_common::logging::LogConfig;
use bootline_common::retry::RetryPolicy;
use bootline_common::state::{FileStateStore, StageMarker, StateStore};
use bootline_common::wait::ConditionWaiter;
use bootline_common::{Error, Result, BOOTSTRAP_COMPLETE_SENTINEL};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use crate::connector::{ClusterConnector, KubeconfigConnector};
use crate::detect::{detect, NodeMembershipProbe};
use crate::pipeline::Pipeline;
use crate::stages::{build_stages, steps_for, HostLayout, StageContext};

const DEFAULT_ADDONS: &str = "network,load-balancer,ingress,storage,monitoring,management-ui";

/// Bootline - first-boot Kubernetes node bootstrap
#[derive(Parser, Debug)]
#[command(name = "bootline", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub node: NodeArgs,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the bootstrap pipeline (default)
    Run,
    /// List stage markers in pipeline order
    Status,
    /// Remove every stage marker so the next run starts from scratch
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

/// Node settings, each overridable by flag
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node role: primary or secondary
    #[arg(long, global = true, env = "BOOTLINE_ROLE")]
    pub role: Option<String>,

    /// Hostname, also the Kubernetes node name
    #[arg(long, global = true, env = "BOOTLINE_HOSTNAME")]
    pub hostname: Option<String>,

    /// Address on the cluster network
    #[arg(long, global = true, env = "BOOTLINE_PRIVATE_IP")]
    pub private_ip: Option<IpAddr>,

    /// Publicly reachable address, added to the API server certificate
    #[arg(long, global = true, env = "BOOTLINE_EXTERNAL_IP")]
    pub external_ip: Option<IpAddr>,

    /// Position of this node in the deployment
    #[arg(long, global = true, env = "BOOTLINE_NODE_INDEX", default_value_t = 0)]
    pub node_index: u32,

    /// Primary's API endpoint (host:port); required on secondary nodes
    #[arg(long, global = true, env = "BOOTLINE_API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    /// Join as an additional control-plane node
    #[arg(
        long,
        global = true,
        env = "BOOTLINE_CONTROL_PLANE_JOIN",
        action = ArgAction::Set,
        default_value_t = false,
        value_parser = BoolishValueParser::new()
    )]
    pub control_plane_join: bool,

    /// Number of control-plane nodes in the cluster
    #[arg(long, global = true, env = "BOOTLINE_CONTROL_PLANE_COUNT", default_value_t = 1)]
    pub control_plane_count: u32,

    /// Pod network CIDR
    #[arg(long, global = true, env = "BOOTLINE_POD_CIDR", default_value = DEFAULT_POD_CIDR)]
    pub pod_cidr: String,

    /// Kubernetes version passed to kubeadm init
    #[arg(long, global = true, env = "BOOTLINE_K8S_VERSION")]
    pub k8s_version: Option<String>,

    /// LoadBalancer address range (`a.b.c.d-a.b.c.e` or CIDR)
    #[arg(long, global = true, env = "BOOTLINE_LB_RANGE")]
    pub lb_range: Option<String>,

    /// Non-root user that also receives the admin kubeconfig
    #[arg(long, global = true, env = "BOOTLINE_ADMIN_USER")]
    pub admin_user: Option<String>,

    /// Stage marker directory
    #[arg(long, global = true, env = "BOOTLINE_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Persistent log file
    #[arg(long, global = true, env = "BOOTLINE_LOG_FILE", default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    /// Join artifact directory shared with secondary nodes
    #[arg(long, global = true, env = "BOOTLINE_JOIN_DIR", default_value = DEFAULT_JOIN_DIR)]
    pub join_dir: PathBuf,

    /// Directory holding the pinned addon manifests and charts
    #[arg(long, global = true, env = "BOOTLINE_MANIFEST_DIR", default_value = DEFAULT_MANIFEST_DIR)]
    pub manifest_dir: PathBuf,

    /// Comma-separated addons to deploy
    #[arg(long, global = true, env = "BOOTLINE_ADDONS", default_value = DEFAULT_ADDONS)]
    pub addons: String,

    /// Seconds to wait for the API server
    #[arg(long, global = true, env = "BOOTLINE_API_WAIT_SECS", default_value_t = 600)]
    pub api_wait_secs: u64,

    /// Seconds a secondary waits for the cluster-ready signal
    #[arg(long, global = true, env = "BOOTLINE_CLUSTER_READY_WAIT_SECS", default_value_t = 1800)]
    pub cluster_ready_wait_secs: u64,
}

impl NodeArgs {
    /// Validate into the immutable boot configuration
    pub fn into_config(&self) -> Result<BootConfig> {
        let role = Role::from_str(required(&self.role, "BOOTLINE_ROLE")?)?;
        let hostname = required(&self.hostname, "BOOTLINE_HOSTNAME")?.to_string();
        let private_ip = self
            .private_ip
            .ok_or_else(|| Error::configuration("BOOTLINE_PRIVATE_IP is required"))?;

        let api_endpoint = match (&self.api_endpoint, role) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Role::Primary) => default_api_endpoint(private_ip),
            (None, Role::Secondary) => {
                return Err(Error::configuration(
                    "BOOTLINE_API_ENDPOINT is required on secondary nodes",
                ))
            }
        };

        let config = BootConfig {
            identity: NodeIdentity {
                hostname,
                role,
                private_ip,
                external_ip: self.external_ip,
                node_index: self.node_index,
            },
            cluster: ClusterSettings {
                api_endpoint,
                control_plane_join: self.control_plane_join,
                control_plane_count: self.control_plane_count,
                pod_network_cidr: self.pod_cidr.clone(),
                kubernetes_version: self.k8s_version.clone(),
                load_balancer_range: self.lb_range.clone(),
                admin_user: self.admin_user.clone(),
            },
            paths: BootPaths {
                state_dir: self.state_dir.clone(),
                log_file: self.log_file.clone(),
                join_dir: self.join_dir.clone(),
                manifest_dir: self.manifest_dir.clone(),
                ..BootPaths::default()
            },
            timeouts: BootTimeouts {
                api_server: Duration::from_secs(self.api_wait_secs),
                cluster_ready: Duration::from_secs(self.cluster_ready_wait_secs),
                ..BootTimeouts::default()
            },
            addons: parse_addons(&self.addons)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn required<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::configuration(format!("{var} is required")))
}

impl Cli {
    fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }

    /// Logger settings: `run` appends to the log file, the operator
    /// commands only talk to the console
    pub fn log_config(&self) -> LogConfig {
        let log_file = (self.command() == Commands::Run).then(|| self.node.log_file.clone());
        LogConfig {
            log_file,
            ..LogConfig::default()
        }
    }

    /// Run the selected command and return the process exit code
    pub async fn run(self) -> Result<u8> {
        match self.command() {
            Commands::Run => run_pipeline(&self.node).await,
            Commands::Status => {
                let store = FileStateStore::new(&self.node.state_dir);
                let order: Vec<String> = self
                    .node
                    .into_config()
                    .map(|config| steps_for(&config).iter().map(|s| s.name()).collect())
                    .unwrap_or_default();
                for line in status_lines(&order, store.completed()?) {
                    println!("{line}");
                }
                Ok(0)
            }
            Commands::Reset { yes } => {
                if !yes {
                    return Err(Error::configuration(
                        "reset removes every stage marker; pass --yes to confirm",
                    ));
                }
                let store = FileStateStore::new(&self.node.state_dir);
                let removed = store.completed()?.len();
                store.reset()?;
                println!("Removed {removed} stage markers from {}", store.dir().display());
                Ok(0)
            }
        }
    }
}

async fn run_pipeline(node: &NodeArgs) -> Result<u8> {
    let config = Arc::new(node.into_config()?);
    info!(
        role = %config.identity.role,
        node = %config.identity.hostname,
        endpoint = %config.cluster.api_endpoint,
        "Bootline starting"
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let connector: Arc<dyn ClusterConnector> =
        Arc::new(KubeconfigConnector::new(config.paths.user_kubeconfig(None)));
    let membership = Arc::new(NodeMembershipProbe::new(runner.clone(), connector.clone()));
    let store = Arc::new(FileStateStore::new(&config.paths.state_dir));

    let status = detect(store.as_ref(), membership.as_ref(), &config.identity.hostname).await;
    if status.is_bootstrapped() {
        info!("{BOOTSTRAP_COMPLETE_SENTINEL}: node already bootstrapped, nothing to do");
        return Ok(0);
    }

    let gate_kubeconfig = match config.identity.role {
        Role::Primary => config.paths.admin_kubeconfig.clone(),
        Role::Secondary => config.paths.admin_credentials(),
    };
    let bootstrapper = ClusterBootstrapper::new(
        config.clone(),
        Arc::new(KubeadmCli::new(runner.clone())),
        runner.clone(),
        Arc::new(ClusterJoinGate::new(gate_kubeconfig)),
    );
    let charts = Arc::new(HelmCli::new(
        runner.clone(),
        config.paths.admin_kubeconfig.clone(),
    ));

    let ctx = StageContext {
        config: config.clone(),
        runner,
        connector,
        bootstrapper: Arc::new(bootstrapper),
        charts,
        membership,
        host: HostLayout::default(),
        waiter: ConditionWaiter::new(),
        retry: RetryPolicy::default(),
    };

    let pipeline = Pipeline::new(build_stages(Arc::new(ctx)), store)?;
    let report = pipeline.run().await;
    Ok(report.exit_code())
}

/// One line per stage in pipeline order, then any markers the current
/// configuration does not declare
pub fn status_lines(order: &[String], markers: Vec<StageMarker>) -> Vec<String> {
    let mut by_stage: HashMap<String, StageMarker> = markers
        .into_iter()
        .map(|m| (m.stage.clone(), m))
        .collect();

    let mut lines: Vec<String> = order
        .iter()
        .map(|stage| match by_stage.remove(stage) {
            Some(marker) => format!("{stage:<24} completed {}", marker.completed_at.to_rfc3339()),
            None => format!("{stage:<24} pending"),
        })
        .collect();

    let mut extra: Vec<StageMarker> = by_stage.into_values().collect();
    extra.sort_by_key(|m| m.completed_at);
    lines.extend(
        extra
            .iter()
            .map(|m| format!("{:<24} completed {}", m.stage, m.completed_at.to_rfc3339())),
    );
    lines
}
