use crate::values::{ValuesTree, deep_merge, empty_tree, load_values_file};
use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Path fragments of charts that are known to be operators.
const OPERATOR_MARKERS: &[&str] = &["gpu-operator", "prometheus-operator", "mpi-operator", "nfd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Local,
    Remote,
    Operator,
}

#[derive(Debug, Clone)]
pub struct Chart {
    pub name: String,
    pub path: PathBuf,
    pub chart_type: ChartType,
    /// Merged values: chart defaults, then values files, then inline values
    pub values: ValuesTree,
}

/// What the renderer produced for one chart.
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Rendered(String),
    Failed(String),
}

/// A chart as declared in the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, rename = "type")]
    pub chart_type: Option<ChartType>,
    #[serde(default)]
    pub values_files: Vec<PathBuf>,
    #[serde(default)]
    pub values: Option<ValuesTree>,
}

impl ChartEntry {
    /// Resolves paths against `base_dir` and merges the chart's values.
    pub fn load(&self, base_dir: &Path) -> Result<Chart> {
        let path = base_dir.join(&self.path);
        if !path.is_dir() {
            bail!("Chart directory does not exist: {}", path.display());
        }

        let mut values = empty_tree();
        let defaults = path.join("values.yaml");
        if defaults.is_file() {
            values = load_values_file(&defaults)?;
        }
        for file in &self.values_files {
            deep_merge(&mut values, load_values_file(base_dir.join(file))?);
        }
        if let Some(inline) = &self.values {
            deep_merge(&mut values, inline.clone());
        }

        let chart_type = self.chart_type.unwrap_or_else(|| detect_chart_type(&path));
        debug!(chart = %self.name, path = %path.display(), ?chart_type, "Loaded chart");

        Ok(Chart {
            name: self.name.clone(),
            path,
            chart_type,
            values,
        })
    }
}

/// Loads every chart entry, skipping the ones that fail with a warning.
pub fn load_charts(entries: &[ChartEntry], base_dir: &Path) -> Vec<Chart> {
    entries
        .iter()
        .filter_map(|entry| match entry.load(base_dir) {
            Ok(chart) => Some(chart),
            Err(e) => {
                warn!("Skipping chart {}: {:#}", entry.name, e);
                None
            }
        })
        .collect()
}

/// Operators are recognised by a known name in the path or by a `crds/` directory.
pub fn detect_chart_type(path: &Path) -> ChartType {
    let path_str = path.to_string_lossy();
    if OPERATOR_MARKERS
        .iter()
        .any(|marker| path_str.contains(marker))
    {
        return ChartType::Operator;
    }
    if path.join("crds").is_dir() {
        return ChartType::Operator;
    }
    ChartType::Local
}
