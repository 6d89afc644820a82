//! Test doubles for seams owned by other crates, and a stage context builder

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bootline_addons::{ChartInstaller, ChartRelease, ClusterApi, NodeReadiness};
use bootline_cluster::{
    ClusterBootstrapper, InitRequest, JoinCommand, JoinGate, JoinRequest, Kubeadm,
};
use bootline_common::command::{CommandOutput, CommandRunner};
use bootline_common::config::{
    default_api_endpoint, AddonKind, BootConfig, BootPaths, BootTimeouts, ClusterSettings,
    NodeIdentity, Role,
};
use bootline_common::kube_utils::RolloutStatus;
use bootline_common::retry::RetryPolicy;
use bootline_common::wait::ConditionWaiter;
use bootline_common::Result;
use mockall::mock;
use serde_json::Value;

use crate::connector::StaticConnector;
use crate::detect::{MembershipProbe, MockMembershipProbe};
use crate::stages::{HostLayout, StageContext};

mock! {
    pub Runner {}

    #[async_trait]
    impl CommandRunner for Runner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
    }
}

mock! {
    pub ClusterApi {}

    #[async_trait]
    impl ClusterApi for ClusterApi {
        async fn api_healthy(&self) -> Result<bool>;
        async fn ensure_namespace(&self, name: &str) -> Result<()>;
        async fn apply(&self, document: &Value) -> Result<()>;
        async fn deployment_status(&self, namespace: &str, name: &str) -> Result<Option<RolloutStatus>>;
        async fn daemonset_status(&self, namespace: &str, name: &str) -> Result<Option<RolloutStatus>>;
        async fn crd_established(&self, name: &str) -> Result<bool>;
        async fn nodes_ready(&self) -> Result<NodeReadiness>;
        async fn node_ready(&self, name: &str) -> Result<bool>;
        async fn control_plane_nodes(&self) -> Result<Vec<String>>;
        async fn remove_node_label(&self, node: &str, label: &str) -> Result<()>;
        async fn remove_node_taint(&self, node: &str, key: &str) -> Result<bool>;
        async fn set_default_storage_class(&self, name: &str) -> Result<()>;
    }
}

mock! {
    pub ChartInstaller {}

    #[async_trait]
    impl ChartInstaller for ChartInstaller {
        async fn template(&self, release: &ChartRelease) -> Result<String>;
        async fn upgrade_install(&self, release: &ChartRelease) -> Result<()>;
    }
}

mock! {
    pub Kubeadm {}

    #[async_trait]
    impl Kubeadm for Kubeadm {
        async fn init(&self, request: &InitRequest) -> Result<()>;
        async fn join(&self, request: &JoinRequest) -> Result<()>;
        async fn create_join_command(&self) -> Result<JoinCommand>;
        async fn upload_certs(&self) -> Result<String>;
    }
}

mock! {
    pub JoinGate {}

    #[async_trait]
    impl JoinGate for JoinGate {
        async fn api_reachable(&self, endpoint: &str) -> Result<bool>;
        async fn ready_signal_present(&self) -> Result<bool>;
    }
}

/// Boot configuration with every path under `dir`
pub fn boot_config(role: Role, dir: &Path) -> BootConfig {
    let primary_ip: IpAddr = "10.0.0.10".parse().unwrap();
    let private_ip: IpAddr = match role {
        Role::Primary => primary_ip,
        Role::Secondary => "10.0.0.11".parse().unwrap(),
    };
    BootConfig {
        identity: NodeIdentity {
            hostname: "node-0".to_string(),
            role,
            private_ip,
            external_ip: None,
            node_index: 0,
        },
        cluster: ClusterSettings {
            api_endpoint: default_api_endpoint(primary_ip),
            control_plane_join: false,
            control_plane_count: 1,
            pod_network_cidr: "10.244.0.0/16".to_string(),
            kubernetes_version: None,
            load_balancer_range: None,
            admin_user: None,
        },
        paths: BootPaths {
            state_dir: dir.join("state"),
            log_file: dir.join("bootline.log"),
            join_dir: dir.join("join"),
            manifest_dir: dir.join("manifests"),
            admin_kubeconfig: dir.join("admin.conf"),
            kubelet_kubeconfig: dir.join("kubelet.conf"),
            root_home: dir.join("root"),
            user_home_base: dir.join("home"),
        },
        timeouts: BootTimeouts {
            api_server: Duration::from_secs(600),
            cluster_ready: Duration::from_secs(1800),
            node_ready: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        },
        addons: AddonKind::ALL.to_vec(),
    }
}

/// Replaceable pieces of a [`StageContext`]
pub struct ContextParts {
    pub config: BootConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub api: Arc<dyn ClusterApi>,
    pub charts: Arc<dyn ChartInstaller>,
    pub kubeadm: Arc<dyn Kubeadm>,
    pub gate: Arc<dyn JoinGate>,
    pub membership: Arc<dyn MembershipProbe>,
    pub host: HostLayout,
}

/// Runner that accepts every command
pub fn permissive_runner() -> MockRunner {
    let mut runner = MockRunner::new();
    runner
        .expect_run()
        .returning(|_, _| Ok(CommandOutput::default()));
    runner
}

/// Stage context whose collaborators are strict mocks unless `customize`
/// replaces them
pub fn context_with(
    role: Role,
    dir: &Path,
    customize: impl FnOnce(&mut ContextParts),
) -> StageContext {
    let mut parts = ContextParts {
        config: boot_config(role, dir),
        runner: Arc::new(permissive_runner()),
        api: Arc::new(MockClusterApi::new()),
        charts: Arc::new(MockChartInstaller::new()),
        kubeadm: Arc::new(MockKubeadm::new()),
        gate: Arc::new(MockJoinGate::new()),
        membership: Arc::new(MockMembershipProbe::new()),
        host: HostLayout {
            etc_dir: dir.join("etc"),
            runtime_socket: dir.join("containerd.sock"),
        },
    };
    customize(&mut parts);

    let config = Arc::new(parts.config);
    let waiter = ConditionWaiter::new();
    let bootstrapper = ClusterBootstrapper::new(
        config.clone(),
        parts.kubeadm,
        parts.runner.clone(),
        parts.gate,
    )
    .with_waiter(waiter.clone());

    StageContext {
        config,
        runner: parts.runner,
        connector: Arc::new(StaticConnector(parts.api)),
        bootstrapper: Arc::new(bootstrapper),
        charts: parts.charts,
        membership: parts.membership,
        host: parts.host,
        waiter,
        retry: RetryPolicy::new(3, Duration::from_secs(1)),
    }
}
