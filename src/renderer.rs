use crate::chart::{Chart, RenderOutcome};
use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Turns a chart plus its merged values into Kubernetes manifests.
pub trait Renderer {
    async fn render(&self, chart: &Chart) -> RenderOutcome;
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub chart: Arc<Chart>,
    pub outcome: RenderOutcome,
}

/// Renders through `helm template`, client side only.
#[derive(Debug, Clone)]
pub struct HelmRenderer {
    pub helm_binary: PathBuf,
    pub namespace: String,
    pub kube_version: String,
    pub timeout: Duration,
}

impl HelmRenderer {
    async fn run_helm(&self, chart: &Chart) -> Result<String> {
        // helm reads the merged values from a file, it must outlive the process
        let mut values_file =
            tempfile::NamedTempFile::new().context("Failed to create values file")?;
        let values_yaml =
            serde_yaml_ng::to_string(&chart.values).context("Failed to serialize values")?;
        values_file
            .write_all(values_yaml.as_bytes())
            .context("Failed to write values file")?;

        let mut command = Command::new(&self.helm_binary);
        command
            .arg("template")
            .arg(&chart.name)
            .arg(&chart.path)
            .arg("--namespace")
            .arg(&self.namespace)
            .arg("--kube-version")
            .arg(&self.kube_version)
            .arg("--values")
            .arg(values_file.path())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("helm template timed out after {:?}", self.timeout))?
            .with_context(|| format!("Failed to run {}", self.helm_binary.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "helm template exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Renderer for HelmRenderer {
    async fn render(&self, chart: &Chart) -> RenderOutcome {
        debug!(chart = %chart.name, path = %chart.path.display(), "Rendering chart");
        match self.run_helm(chart).await {
            Ok(manifest) => {
                debug!(chart = %chart.name, manifest_size = manifest.len(), "Rendered chart");
                RenderOutcome::Rendered(manifest)
            }
            Err(e) => {
                warn!("Rendering chart {} failed, falling back to values: {:#}", chart.name, e);
                RenderOutcome::Failed(format!("{:#}", e))
            }
        }
    }
}

/// Renders all charts with at most `workers` renders in flight.
pub async fn render_all<R: Renderer>(
    renderer: &R,
    charts: &[Arc<Chart>],
    workers: usize,
) -> Vec<RenderResult> {
    let results: Vec<RenderResult> = stream::iter(charts.iter().cloned())
        .map(|chart| async move {
            let outcome = renderer.render(&chart).await;
            RenderResult { chart, outcome }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let rendered = results
        .iter()
        .filter(|result| matches!(result.outcome, RenderOutcome::Rendered(_)))
        .count();
    info!("Rendered {} of {} charts", rendered, results.len());

    results
}
