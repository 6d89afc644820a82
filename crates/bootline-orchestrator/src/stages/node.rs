//! prepare-node: host settings kubeadm's preflight checks insist on

use std::path::{Path, PathBuf};
use std::time::Duration;

use bootline_common::command::args;
use bootline_common::retry::retry;
use bootline_common::wait::ConditionCheck;
use bootline_common::{Error, Result};
use tracing::info;

use super::StageContext;

/// Kernel modules required by the container runtime and pod networking
pub const KERNEL_MODULES: [&str; 2] = ["overlay", "br_netfilter"];

/// sysctl settings for bridged pod traffic and routing
pub const SYSCTL_SETTINGS: [(&str, &str); 3] = [
    ("net.bridge.bridge-nf-call-iptables", "1"),
    ("net.bridge.bridge-nf-call-ip6tables", "1"),
    ("net.ipv4.ip_forward", "1"),
];

const CONTAINER_RUNTIME: &str = "containerd";
const RUNTIME_SOCKET_WAIT: Duration = Duration::from_secs(120);

/// Host filesystem locations touched by node preparation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostLayout {
    /// Root of the host configuration tree, normally `/etc`
    pub etc_dir: PathBuf,
    /// Container runtime socket kubelet connects to
    pub runtime_socket: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            etc_dir: PathBuf::from("/etc"),
            runtime_socket: PathBuf::from("/run/containerd/containerd.sock"),
        }
    }
}

impl HostLayout {
    fn fstab(&self) -> PathBuf {
        self.etc_dir.join("fstab")
    }

    fn modules_load(&self) -> PathBuf {
        self.etc_dir.join("modules-load.d").join("k8s.conf")
    }

    fn sysctl_dropin(&self) -> PathBuf {
        self.etc_dir.join("sysctl.d").join("99-kubernetes-cri.conf")
    }
}

pub(super) async fn prepare_node(ctx: &StageContext) -> Result<()> {
    let hostname = &ctx.config.identity.hostname;
    run_retried(ctx, "hostnamectl", args(&["set-hostname", hostname.as_str()])).await?;

    run_retried(ctx, "swapoff", args(&["-a"])).await?;
    disable_swap_entries(&ctx.host.fstab()).await?;

    for module in KERNEL_MODULES {
        run_retried(ctx, "modprobe", args(&[module])).await?;
    }
    write_host_file(&ctx.host.modules_load(), &modules_load_contents()).await?;

    write_host_file(&ctx.host.sysctl_dropin(), &sysctl_contents()).await?;
    run_retried(ctx, "sysctl", args(&["--system"])).await?;

    run_retried(ctx, "systemctl", args(&["enable", "--now", CONTAINER_RUNTIME])).await?;

    let socket = ctx.host.runtime_socket.as_path();
    let check = ConditionCheck::new(
        format!("container runtime socket {}", socket.display()),
        RUNTIME_SOCKET_WAIT,
        ctx.config.timeouts.poll_interval,
    );
    ctx.waiter
        .wait_for(&check, || async move {
            Ok::<_, Error>(tokio::fs::try_exists(socket).await.unwrap_or(false))
        })
        .await?;

    info!(node = %hostname, "Node prepared");
    Ok(())
}

async fn run_retried(ctx: &StageContext, program: &str, argv: Vec<String>) -> Result<()> {
    let name = format!("{program} {}", argv.join(" "));
    retry(&ctx.retry, &name, || ctx.runner.run(program, &argv)).await?;
    Ok(())
}

async fn write_host_file(path: &Path, contents: &str) -> Result<()> {
    let io_err = |e: std::io::Error| {
        Error::fatal("prepare_node", format!("failed to write {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, contents).await.map_err(io_err)
}

async fn disable_swap_entries(fstab: &Path) -> Result<()> {
    let current = match tokio::fs::read_to_string(fstab).await {
        Ok(current) => current,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::fatal(
                "prepare_node",
                format!("failed to read {}: {e}", fstab.display()),
            ))
        }
    };
    let updated = comment_out_swap(&current);
    if updated != current {
        write_host_file(fstab, &updated).await?;
        info!(path = %fstab.display(), "Disabled swap entries");
    }
    Ok(())
}

/// Comment out every active swap entry in an fstab. Already-commented lines
/// are left alone, so the result is stable under repeated application.
pub fn comment_out_swap(fstab: &str) -> String {
    let mut out = String::with_capacity(fstab.len());
    for line in fstab.lines() {
        let trimmed = line.trim_start();
        let is_swap = !trimmed.starts_with('#')
            && trimmed.split_whitespace().nth(2) == Some("swap");
        if is_swap {
            out.push('#');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn modules_load_contents() -> String {
    KERNEL_MODULES.iter().map(|m| format!("{m}\n")).collect()
}

fn sysctl_contents() -> String {
    SYSCTL_SETTINGS
        .iter()
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect()
}
