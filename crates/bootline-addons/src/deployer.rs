//! AddonDeployer
//!
//! Deploys one pinned addon end to end:
//!
//! 1. render the manifests and validate readiness targets against them
//! 2. ensure the namespace exists
//! 3. apply (retried; server-side apply is idempotent)
//! 4. wait for readiness
//! 5. run post-install fixups
//!
//! Any failure halts the deployment; the calling stage decides nothing else.

use std::sync::Arc;
use std::time::Duration;

use bootline_common::config::BootConfig;
use bootline_common::kube_utils::sort_for_apply;
use bootline_common::retry::{retry, RetryPolicy};
use bootline_common::wait::{ConditionCheck, ConditionWaiter};
use bootline_common::yaml::{parse_document, split_yaml_documents};
use bootline_common::{Error, Result};
use serde_json::Value;
use tracing::info;

use crate::addon::{AddonSpec, ManifestSource};
use crate::api::ClusterApi;
use crate::fixups::run_fixup;
use crate::helm::{ChartInstaller, ChartRelease};
use crate::readiness::{observe_targets, validate_targets};

/// Manifests or chart release, ready to apply
enum Rendered {
    Documents(Vec<Value>),
    Chart(ChartRelease),
}

/// Applies addons and gates on their readiness
pub struct AddonDeployer {
    api: Arc<dyn ClusterApi>,
    charts: Arc<dyn ChartInstaller>,
    config: Arc<BootConfig>,
    retry: RetryPolicy,
    waiter: ConditionWaiter,
}

impl AddonDeployer {
    /// Create a deployer with the default retry policy (3 attempts, fixed delay)
    pub fn new(
        api: Arc<dyn ClusterApi>,
        charts: Arc<dyn ChartInstaller>,
        config: Arc<BootConfig>,
    ) -> Self {
        Self {
            api,
            charts,
            config,
            retry: RetryPolicy::default(),
            waiter: ConditionWaiter::new(),
        }
    }

    /// Override the retry policy used for apply and fixups
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Use `waiter` for readiness gates
    pub fn with_waiter(mut self, waiter: ConditionWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Deploy `spec` and return how long readiness took
    pub async fn deploy(&self, spec: &AddonSpec) -> Result<Duration> {
        let label = spec.label();
        let api = self.api.as_ref();
        info!(addon = %label, namespace = %spec.namespace, "Deploying addon");

        let rendered = self.render(spec).await?;

        retry(&self.retry, &format!("ensure namespace {}", spec.namespace), || {
            api.ensure_namespace(&spec.namespace)
        })
        .await?;

        match &rendered {
            Rendered::Documents(documents) => {
                retry(&self.retry, &format!("apply {label}"), || async move {
                    for document in documents {
                        api.apply(document).await?;
                    }
                    Ok(())
                })
                .await?;
                info!(addon = %label, documents = documents.len(), "Manifests applied");
            }
            Rendered::Chart(release) => {
                let charts = self.charts.as_ref();
                retry(&self.retry, &format!("helm upgrade {label}"), || {
                    charts.upgrade_install(release)
                })
                .await?;
                info!(addon = %label, release = %release.release, "Chart installed");
            }
        }

        let check = ConditionCheck::new(
            format!("addon {label} ready"),
            spec.max_wait,
            self.config.timeouts.poll_interval,
        );
        let elapsed = self
            .waiter
            .wait_for(&check, || observe_targets(api, &spec.readiness))
            .await?;

        for fixup in &spec.fixups {
            retry(&self.retry, &fixup.to_string(), || {
                run_fixup(api, &self.config.cluster, fixup)
            })
            .await?;
        }

        info!(addon = %label, elapsed_secs = elapsed.as_secs(), "Addon deployed");
        Ok(elapsed)
    }

    /// Load the pinned manifests (or render the chart) and check the
    /// readiness contract against them before anything is applied
    async fn render(&self, spec: &AddonSpec) -> Result<Rendered> {
        let paths = &self.config.paths;
        let (rendered, yaml) = match &spec.source {
            ManifestSource::Manifest { file } => {
                let path = paths.manifest(file);
                let yaml = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::configuration_at(
                        &path,
                        format!("pinned manifest for {} is unreadable: {e}", spec.label()),
                    )
                })?;
                (None, yaml)
            }
            ManifestSource::Chart {
                release,
                chart,
                values,
            } => {
                let chart_path = paths.manifest(chart);
                if !chart_path.exists() {
                    return Err(Error::configuration_at(
                        &chart_path,
                        format!("pinned chart for {} is missing", spec.label()),
                    ));
                }
                let release = ChartRelease {
                    release: release.clone(),
                    chart: chart_path,
                    namespace: spec.namespace.clone(),
                    values: values.as_ref().map(|v| paths.manifest(v)),
                };
                let yaml = self.charts.template(&release).await?;
                (Some(release), yaml)
            }
        };

        let mut documents = split_yaml_documents(&yaml)
            .iter()
            .map(|doc| parse_document(doc))
            .collect::<Result<Vec<_>>>()?;
        validate_targets(spec, &documents)?;

        Ok(match rendered {
            Some(release) => Rendered::Chart(release),
            None => {
                sort_for_apply(&mut documents);
                Rendered::Documents(documents)
            }
        })
    }
}
