use crate::chart::ChartEntry;
use crate::operator::{OperatorConfig, OperatorSpec, load_operator_config};
use crate::output::OutputConfig;
use crate::policy::PolicyConfig;
use crate::values_scanner::DEFAULT_MAX_DEPTH;
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use std::{env, fs};
use tracing::info;

static ENV_VAR_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)}").unwrap());

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub workers: usize,
    pub max_depth: usize,
    pub cache: bool,
    pub render: RenderConfig,
    pub charts: Vec<ChartEntry>,
    pub operators_file: Option<PathBuf>,
    pub operators: BTreeMap<String, OperatorSpec>,
    pub policy: PolicyConfig,
    pub output: OutputConfig,
    /// Directory chart, values and operator paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 5,
            max_depth: DEFAULT_MAX_DEPTH,
            cache: false,
            render: RenderConfig::default(),
            charts: Vec::new(),
            operators_file: None,
            operators: BTreeMap::new(),
            policy: PolicyConfig::default(),
            output: OutputConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfig {
    pub enabled: bool,
    pub helm_binary: PathBuf,
    pub namespace: String,
    pub kube_version: String,
    pub timeout_seconds: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            helm_binary: PathBuf::from("helm"),
            namespace: "default".to_string(),
            kube_version: "v1.28.0".to_string(),
            timeout_seconds: 120,
        }
    }
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    info!("Loading config from file {}", path.display());
    let yaml_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let mut config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(config)
}

impl Config {
    /// Operator table from `operatorsFile` with inline `operators` on top.
    pub fn operator_config(&self) -> Result<OperatorConfig> {
        let mut operators = match &self.operators_file {
            Some(file) => load_operator_config(self.base_dir.join(file))?,
            None => OperatorConfig::default(),
        };
        operators.merge(OperatorConfig {
            operators: self.operators.clone(),
        });
        Ok(operators)
    }
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut missing = None;

    let result = ENV_VAR_PLACEHOLDER.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(anyhow!("Missing environment variable: {}", var_name)),
        None => Ok(result.into_owned()),
    }
}
