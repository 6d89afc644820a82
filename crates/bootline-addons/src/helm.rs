//! Helm chart driver
//!
//! Charts have no maintained Rust client, so helm is driven through
//! [`CommandRunner`] with explicit argument lists.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bootline_common::command::{args, CommandRunner};
use bootline_common::Result;
#[cfg(test)]
use mockall::automock;

const HELM: &str = "helm";

/// A chart release to render or install
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartRelease {
    /// Release name
    pub release: String,
    /// Local chart archive
    pub chart: PathBuf,
    /// Target namespace
    pub namespace: String,
    /// Optional values file
    pub values: Option<PathBuf>,
}

impl ChartRelease {
    fn common_args(&self) -> Vec<String> {
        let mut argv = vec![
            self.release.clone(),
            self.chart.display().to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        if let Some(values) = &self.values {
            argv.push("--values".to_string());
            argv.push(values.display().to_string());
        }
        argv
    }

    /// Arguments for `helm template`
    pub fn template_args(&self) -> Vec<String> {
        let mut argv = args(&["template"]);
        argv.extend(self.common_args());
        argv.push("--include-crds".to_string());
        argv
    }

    /// Arguments for `helm upgrade --install`
    pub fn install_args(&self, kubeconfig: &std::path::Path) -> Vec<String> {
        let mut argv = args(&["upgrade", "--install"]);
        argv.extend(self.common_args());
        argv.push("--kubeconfig".to_string());
        argv.push(kubeconfig.display().to_string());
        argv
    }
}

/// Trait for rendering and installing Helm charts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Render the chart to multi-document YAML without touching the cluster
    async fn template(&self, release: &ChartRelease) -> Result<String>;

    /// Install or upgrade the release. Idempotent.
    async fn upgrade_install(&self, release: &ChartRelease) -> Result<()>;
}

/// [`ChartInstaller`] backed by the helm binary
pub struct HelmCli {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: PathBuf,
}

impl HelmCli {
    /// Drive helm through `runner` against the cluster in `kubeconfig`
    pub fn new(runner: Arc<dyn CommandRunner>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.into(),
        }
    }
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn template(&self, release: &ChartRelease) -> Result<String> {
        let output = self.runner.run(HELM, &release.template_args()).await?;
        Ok(output.stdout)
    }

    async fn upgrade_install(&self, release: &ChartRelease) -> Result<()> {
        self.runner
            .run(HELM, &release.install_args(&self.kubeconfig))
            .await
            .map(|_| ())
    }
}
