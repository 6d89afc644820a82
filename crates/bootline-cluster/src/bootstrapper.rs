//! ClusterBootstrapper: control-plane init (primary) and cluster join (secondary)

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bootline_common::command::{args, CommandRunner};
use bootline_common::config::BootConfig;
use bootline_common::retry::{retry, RetryPolicy};
use bootline_common::wait::{ConditionCheck, ConditionWaiter};
use bootline_common::{Error, Result, READY_SIGNAL_CONFIGMAP, READY_SIGNAL_NAMESPACE};
use tracing::{info, warn};

use crate::join_info::{write_secret, ClusterJoinInfo};
use crate::kubeadm::{ControlPlaneJoin, InitRequest, JoinRequest, Kubeadm};
use crate::probe::JoinGate;

/// Result of [`ClusterBootstrapper::init`]
#[derive(Debug)]
pub struct InitOutcome {
    /// An already-running control plane was found and kubeadm init skipped
    pub adopted: bool,
    /// Join info published for secondary nodes
    pub join_info: ClusterJoinInfo,
}

/// Wraps kubeadm init/join and the credential plumbing around them.
pub struct ClusterBootstrapper {
    config: Arc<BootConfig>,
    kubeadm: Arc<dyn Kubeadm>,
    runner: Arc<dyn CommandRunner>,
    gate: Arc<dyn JoinGate>,
    waiter: ConditionWaiter,
}

impl ClusterBootstrapper {
    /// Create a bootstrapper for this node
    pub fn new(
        config: Arc<BootConfig>,
        kubeadm: Arc<dyn Kubeadm>,
        runner: Arc<dyn CommandRunner>,
        gate: Arc<dyn JoinGate>,
    ) -> Self {
        Self {
            config,
            kubeadm,
            runner,
            gate,
            waiter: ConditionWaiter::new(),
        }
    }

    /// Use `waiter` for the join gates
    pub fn with_waiter(mut self, waiter: ConditionWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Initialize the control plane and publish join info.
    ///
    /// If a previous run crashed after `kubeadm init` succeeded, the running
    /// control plane is adopted instead of re-running init. After a reboot
    /// the API server may still be starting, so an existing admin kubeconfig
    /// gets the full API server wait before init is retried. Init failure is
    /// fatal.
    pub async fn init(&self) -> Result<InitOutcome> {
        let paths = &self.config.paths;
        let endpoint = self.config.cluster.api_endpoint.as_str();

        let adopted =
            paths.admin_kubeconfig.exists() && self.existing_api_reachable(endpoint).await;

        if adopted {
            info!(endpoint = %endpoint, "Existing control plane is healthy, adopting it");
        } else {
            if paths.admin_kubeconfig.exists() {
                warn!(
                    kubeconfig = %paths.admin_kubeconfig.display(),
                    "Admin kubeconfig present but API server never became reachable, running kubeadm init"
                );
            }
            let request = InitRequest::from_config(&self.config);
            info!(node = %request.node_name, endpoint = %request.control_plane_endpoint, "Initializing control plane");
            self.kubeadm
                .init(&request)
                .await
                .map_err(|e| e.into_fatal("kubeadm init"))?;
        }

        self.install_admin_credentials(&paths.admin_kubeconfig)?;
        let join_info = self.publish_join_info().await?;

        Ok(InitOutcome { adopted, join_info })
    }

    async fn existing_api_reachable(&self, endpoint: &str) -> bool {
        let timeouts = &self.config.timeouts;
        let gate = self.gate.as_ref();
        let check = ConditionCheck::new(
            format!("existing API server {endpoint} reachable"),
            timeouts.api_server,
            timeouts.poll_interval,
        );
        self.waiter
            .wait(&check, move || gate.api_reachable(endpoint))
            .await
            .satisfied
    }

    /// Generate a fresh join command and certificate key and write the join artifacts
    pub async fn publish_join_info(&self) -> Result<ClusterJoinInfo> {
        let policy = RetryPolicy::default();
        let join_command = retry(&policy, "kubeadm token create", || {
            self.kubeadm.create_join_command()
        })
        .await?;
        let certificate_key =
            retry(&policy, "kubeadm upload-certs", || self.kubeadm.upload_certs()).await?;

        let admin_kubeconfig = &self.config.paths.admin_kubeconfig;
        let admin_credentials = fs::read_to_string(admin_kubeconfig).map_err(|e| {
            Error::configuration_at(admin_kubeconfig, format!("failed to read admin kubeconfig: {e}"))
        })?;

        let join_info = ClusterJoinInfo::new(join_command, certificate_key, admin_credentials)?;
        join_info.persist(&self.config.paths)?;
        Ok(join_info)
    }

    /// Join the cluster described by `info`.
    ///
    /// Waits for the primary's API server, then for its cluster-ready
    /// signal, then makes exactly one join attempt. `kubeadm join` is not
    /// safe to repeat blindly, so any failure is fatal. A node whose kubelet
    /// kubeconfig already exists joined in an earlier run and only gets its
    /// credentials installed.
    pub async fn join(&self, info: &ClusterJoinInfo) -> Result<()> {
        let paths = &self.config.paths;
        let endpoint = self.config.cluster.api_endpoint.as_str();
        if info.api_endpoint != endpoint {
            return Err(Error::configuration_at(
                paths.join_command(),
                format!(
                    "join artifacts target {} but this node is configured for {endpoint}",
                    info.api_endpoint
                ),
            ));
        }

        if paths.kubelet_kubeconfig.exists() {
            info!(
                kubeconfig = %paths.kubelet_kubeconfig.display(),
                "Node already joined, skipping kubeadm join"
            );
        } else {
            self.join_once(info, endpoint).await?;
        }

        let credentials = if self.config.cluster.control_plane_join {
            paths.admin_kubeconfig.clone()
        } else {
            paths.admin_credentials()
        };
        self.install_admin_credentials(&credentials)?;
        self.chown_admin_kubeconfig().await
    }

    async fn join_once(&self, info: &ClusterJoinInfo, endpoint: &str) -> Result<()> {
        let timeouts = &self.config.timeouts;
        let gate = self.gate.as_ref();

        let api_check = ConditionCheck::new(
            format!("API server {endpoint} reachable"),
            timeouts.api_server,
            timeouts.poll_interval,
        );
        self.waiter
            .wait_for(&api_check, move || gate.api_reachable(endpoint))
            .await?;

        let ready_check = ConditionCheck::new(
            format!("cluster-ready signal {READY_SIGNAL_NAMESPACE}/{READY_SIGNAL_CONFIGMAP}"),
            timeouts.cluster_ready,
            timeouts.poll_interval,
        );
        self.waiter
            .wait_for(&ready_check, move || gate.ready_signal_present())
            .await?;

        let identity = &self.config.identity;
        let control_plane = self.config.cluster.control_plane_join.then(|| ControlPlaneJoin {
            certificate_key: info.certificate_key.clone(),
            advertise_address: identity.private_ip,
        });
        let request = JoinRequest {
            command: info.join_command(),
            node_name: identity.hostname.clone(),
            control_plane,
        };

        info!(
            endpoint = %endpoint,
            node = %identity.hostname,
            control_plane = self.config.cluster.control_plane_join,
            "Joining cluster"
        );
        self.kubeadm
            .join(&request)
            .await
            .map_err(|e| e.into_fatal("kubeadm join"))
    }

    /// Copy `source` to root's and the admin user's `~/.kube/config`
    fn install_admin_credentials(&self, source: &Path) -> Result<()> {
        let contents = fs::read(source).map_err(|e| {
            Error::configuration_at(source, format!("failed to read cluster credentials: {e}"))
        })?;

        let paths = &self.config.paths;
        let mut targets = vec![paths.user_kubeconfig(None)];
        if let Some(user) = &self.config.cluster.admin_user {
            targets.push(paths.user_kubeconfig(Some(user)));
        }

        for target in &targets {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::fatal(
                        "install_admin_credentials",
                        format!("failed to create {}: {e}", parent.display()),
                    )
                })?;
            }
            write_secret(target, &contents)?;
            info!(path = %target.display(), "Installed admin kubeconfig");
        }
        Ok(())
    }

    async fn chown_admin_kubeconfig(&self) -> Result<()> {
        let Some(user) = &self.config.cluster.admin_user else {
            return Ok(());
        };
        let kube_dir = self.config.paths.user_home_base.join(user).join(".kube");
        let mut argv = args(&["-R"]);
        argv.push(format!("{user}:{user}"));
        argv.push(kube_dir.display().to_string());
        self.runner.run("chown", &argv).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use bootline_common::config::{
        AddonKind, BootPaths, BootTimeouts, ClusterSettings, NodeIdentity, Role,
    };
    use bootline_common::ErrorKind;
    use tokio::time::Instant;

    use crate::join_info::JoinCommand;
    use crate::kubeadm::MockKubeadm;
    use crate::probe::MockJoinGate;
    use crate::testing::{permissive_runner, MockRunner};

    const KEY: &str = "4f9e1a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7";

    fn config(root: &Path, role: Role) -> BootConfig {
        let ip: IpAddr = "10.0.0.11".parse().unwrap();
        BootConfig {
            identity: NodeIdentity {
                hostname: "node-1".to_string(),
                role,
                private_ip: ip,
                external_ip: None,
                node_index: 1,
            },
            cluster: ClusterSettings {
                api_endpoint: "10.0.0.10:6443".to_string(),
                control_plane_join: false,
                control_plane_count: 1,
                pod_network_cidr: "10.244.0.0/16".to_string(),
                kubernetes_version: None,
                load_balancer_range: None,
                admin_user: None,
            },
            paths: BootPaths {
                state_dir: root.join("state"),
                log_file: root.join("bootline.log"),
                join_dir: root.join("join"),
                manifest_dir: root.join("manifests"),
                admin_kubeconfig: root.join("etc/kubernetes/admin.conf"),
                kubelet_kubeconfig: root.join("etc/kubernetes/kubelet.conf"),
                root_home: root.join("root"),
                user_home_base: root.join("home"),
            },
            timeouts: BootTimeouts::default(),
            addons: vec![AddonKind::NetworkPlugin],
        }
    }

    fn join_command() -> JoinCommand {
        JoinCommand {
            api_endpoint: "10.0.0.10:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            ca_cert_hashes: vec!["sha256:aa".to_string()],
        }
    }

    fn join_info() -> ClusterJoinInfo {
        ClusterJoinInfo::new(join_command(), KEY, "apiVersion: v1\nkind: Config\n").unwrap()
    }

    fn write_admin_kubeconfig(config: &BootConfig) {
        let path = &config.paths.admin_kubeconfig;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "apiVersion: v1\nkind: Config\n").unwrap();
    }

    fn kubeadm_that_publishes() -> MockKubeadm {
        let mut kubeadm = MockKubeadm::new();
        kubeadm
            .expect_create_join_command()
            .returning(|| Ok(join_command()));
        kubeadm
            .expect_upload_certs()
            .returning(|| Ok(KEY.to_string()));
        kubeadm
    }

    fn bootstrapper(
        config: BootConfig,
        kubeadm: MockKubeadm,
        gate: MockJoinGate,
        runner: MockRunner,
    ) -> ClusterBootstrapper {
        ClusterBootstrapper::new(
            Arc::new(config),
            Arc::new(kubeadm),
            Arc::new(runner),
            Arc::new(gate),
        )
    }

    #[tokio::test]
    async fn init_runs_kubeadm_and_publishes_join_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Primary);
        let written = config.clone();

        let mut kubeadm = kubeadm_that_publishes();
        kubeadm.expect_init().times(1).returning(move |request| {
            assert_eq!(request.pod_network_cidr, "10.244.0.0/16");
            write_admin_kubeconfig(&written);
            Ok(())
        });

        let boot = bootstrapper(config.clone(), kubeadm, MockJoinGate::new(), MockRunner::new());
        let outcome = boot.init().await.unwrap();

        assert!(!outcome.adopted);
        assert_eq!(ClusterJoinInfo::load(&config.paths).unwrap(), outcome.join_info);
        assert!(config.paths.user_kubeconfig(None).exists());
    }

    #[tokio::test]
    async fn reentered_init_adopts_healthy_control_plane() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Primary);
        write_admin_kubeconfig(&config);

        let mut kubeadm = kubeadm_that_publishes();
        kubeadm.expect_init().times(0);
        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable().returning(|_| Ok(true));

        let outcome = bootstrapper(config, kubeadm, gate, MockRunner::new())
            .init()
            .await
            .unwrap();
        assert!(outcome.adopted);
    }

    #[tokio::test(start_paused = true)]
    async fn reentered_init_waits_for_restarting_api_server() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Primary);
        write_admin_kubeconfig(&config);

        let polls = Arc::new(Mutex::new(0u32));
        let counted = polls.clone();
        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable().returning(move |_| {
            let mut polls = counted.lock().unwrap();
            *polls += 1;
            if *polls == 1 {
                Err(Error::transient("api_reachable", "connection refused"))
            } else {
                Ok(true)
            }
        });
        let mut kubeadm = kubeadm_that_publishes();
        kubeadm.expect_init().times(0);

        let outcome = bootstrapper(config, kubeadm, gate, MockRunner::new())
            .init()
            .await
            .unwrap();
        assert!(outcome.adopted);
        assert_eq!(*polls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn init_failure_is_fatal_and_publishes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Primary);

        let mut kubeadm = MockKubeadm::new();
        kubeadm
            .expect_init()
            .returning(|_| Err(Error::transient("kubeadm", "preflight checks failed")));
        kubeadm.expect_create_join_command().times(0);

        let err = bootstrapper(config.clone(), kubeadm, MockJoinGate::new(), MockRunner::new())
            .init()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(!config.paths.join_command().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn join_waits_for_api_and_ready_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path(), Role::Secondary);
        config.cluster.admin_user = Some("ops".to_string());
        let info = join_info();
        info.persist(&config.paths).unwrap();

        let start = Instant::now();
        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable()
            .returning(move |_| Ok(start.elapsed() >= Duration::from_secs(15)));
        gate.expect_ready_signal_present().returning(move || {
            assert!(start.elapsed() >= Duration::from_secs(15));
            Ok(start.elapsed() >= Duration::from_secs(25))
        });

        let joined_at = Arc::new(Mutex::new(None));
        let recorded = joined_at.clone();
        let mut kubeadm = MockKubeadm::new();
        kubeadm.expect_join().times(1).returning(move |request| {
            assert!(request.control_plane.is_none());
            *recorded.lock().unwrap() = Some(start.elapsed());
            Ok(())
        });

        let mut runner = MockRunner::new();
        runner
            .expect_run()
            .withf(|program, _| program == "chown")
            .times(1)
            .returning(|_, _| Ok(Default::default()));

        bootstrapper(config.clone(), kubeadm, gate, runner)
            .join(&info)
            .await
            .unwrap();

        let joined_at = joined_at.lock().unwrap().unwrap();
        assert!(joined_at >= Duration::from_secs(25), "joined at {joined_at:?}");
        assert!(config.paths.user_kubeconfig(Some("ops")).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn join_is_not_attempted_when_ready_signal_never_appears() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Secondary);

        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable().returning(|_| Ok(true));
        gate.expect_ready_signal_present().returning(|| Ok(false));
        let mut kubeadm = MockKubeadm::new();
        kubeadm.expect_join().times(0);

        let err = bootstrapper(config, kubeadm, gate, permissive_runner())
            .join(&join_info())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_is_fatal_and_not_repeated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path(), Role::Secondary);
        config.cluster.control_plane_join = true;

        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable().returning(|_| Ok(true));
        gate.expect_ready_signal_present().returning(|| Ok(true));
        let mut kubeadm = MockKubeadm::new();
        kubeadm.expect_join().times(1).returning(|request| {
            assert!(request.control_plane.is_some());
            Err(Error::transient("kubeadm", "etcd member add failed"))
        });

        let err = bootstrapper(config, kubeadm, gate, permissive_runner())
            .join(&join_info())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn reentered_join_skips_kubeadm_and_installs_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), Role::Secondary);
        let info = join_info();
        info.persist(&config.paths).unwrap();

        let mut gate = MockJoinGate::new();
        gate.expect_api_reachable().returning(|_| Ok(true));
        gate.expect_ready_signal_present().returning(|| Ok(true));

        let kubelet_conf = config.paths.kubelet_kubeconfig.clone();
        let mut kubeadm = MockKubeadm::new();
        kubeadm.expect_join().times(1).returning(move |_| {
            fs::create_dir_all(kubelet_conf.parent().unwrap()).unwrap();
            fs::write(&kubelet_conf, "apiVersion: v1\nkind: Config\n").unwrap();
            Ok(())
        });

        let boot = bootstrapper(config.clone(), kubeadm, gate, permissive_runner());
        boot.join(&info).await.unwrap();

        fs::remove_file(config.paths.user_kubeconfig(None)).unwrap();
        boot.join(&info).await.unwrap();
        assert!(config.paths.user_kubeconfig(None).exists());
    }

    #[tokio::test]
    async fn join_rejects_artifacts_for_another_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path(), Role::Secondary);
        config.cluster.api_endpoint = "10.0.0.20:6443".to_string();

        let mut kubeadm = MockKubeadm::new();
        kubeadm.expect_join().times(0);

        let err = bootstrapper(config, kubeadm, MockJoinGate::new(), permissive_runner())
            .join(&join_info())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("10.0.0.20:6443"), "{err}");
    }
}
