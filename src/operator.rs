use crate::values::{ValuesTree, lookup_str};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::{fs, path::Path};
use tracing::{debug, info};

const DEFAULT_TAG: &str = "latest";

/// Chart-name keyed rules for charts that keep image coordinates in shapes
/// the generic values scanner cannot guess.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub operators: BTreeMap<String, OperatorSpec>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageFieldSpec>,
}

/// Dotted paths into a chart's values locating one image.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFieldSpec {
    /// Repository path, e.g. `validator.repository`
    #[serde(alias = "repositoryPath")]
    pub path: String,
    /// Image basename path, e.g. `validator.image`
    #[serde(default, alias = "imageNamePath")]
    pub image_path: Option<String>,
    /// Tag or version path, e.g. `validator.version`
    #[serde(default)]
    pub tag_path: Option<String>,
}

pub fn load_operator_config<P: AsRef<Path>>(path: P) -> Result<OperatorConfig> {
    let path = path.as_ref();
    info!("Loading operator config from file {}", path.display());
    let yaml_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read operator config file: {}", path.display()))?;

    serde_yaml_ng::from_str(&yaml_str)
        .with_context(|| format!("Failed to parse operator config file: {}", path.display()))
}

impl OperatorConfig {
    /// Adds every operator of `other`, replacing entries with the same name.
    pub fn merge(&mut self, other: OperatorConfig) {
        self.operators.extend(other.operators);
    }

    /// Finds the enabled spec for a chart: exact name first, then aliases.
    pub fn find(&self, chart_name: &str) -> Option<&OperatorSpec> {
        if let Some(spec) = self.operators.get(chart_name).filter(|spec| spec.enabled) {
            return Some(spec);
        }

        self.operators
            .values()
            .filter(|spec| spec.enabled)
            .find(|spec| spec.aliases.iter().any(|alias| alias == chart_name))
    }

    /// Images declared for `chart_name`, empty when no enabled spec matches.
    pub fn extract(&self, chart_name: &str, values: &ValuesTree) -> BTreeSet<String> {
        match self.find(chart_name) {
            Some(spec) => {
                let images = spec.extract(values);
                debug!(chart = chart_name, count = images.len(), "Extracted operator images");
                images
            }
            None => {
                debug!(chart = chart_name, "No operator spec configured");
                BTreeSet::new()
            }
        }
    }
}

impl OperatorSpec {
    pub fn extract(&self, values: &ValuesTree) -> BTreeSet<String> {
        self.images
            .iter()
            .filter_map(|field| field.resolve(values))
            .collect()
    }
}

impl ImageFieldSpec {
    /// Composes `repository/image:tag` when an image name resolves, otherwise
    /// `repository:tag`. A missing or empty repository yields nothing.
    pub fn resolve(&self, values: &ValuesTree) -> Option<String> {
        let repository = lookup_str(values, &self.path).filter(|s| !s.is_empty())?;

        let tag = self
            .tag_path
            .as_deref()
            .and_then(|path| lookup_str(values, path))
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TAG);

        let image_name = self
            .image_path
            .as_deref()
            .and_then(|path| lookup_str(values, path))
            .filter(|s| !s.is_empty());

        Some(match image_name {
            Some(image_name) => format!("{}/{}:{}", repository, image_name, tag),
            None => format!("{}:{}", repository, tag),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> ValuesTree {
        serde_yaml_ng::from_str(s).unwrap()
    }

    fn validator_field() -> ImageFieldSpec {
        ImageFieldSpec {
            path: "validator.repository".to_string(),
            image_path: Some("validator.image".to_string()),
            tag_path: Some("validator.version".to_string()),
        }
    }

    fn gpu_operator_config() -> OperatorConfig {
        serde_yaml_ng::from_str(
            r#"
            operators:
              gpu-operator:
                enabled: true
                aliases: [nvidia-gpu-operator]
                images:
                  - path: validator.repository
                    imagePath: validator.image
                    tagPath: validator.version
                  - path: driver.repository
                    tagPath: driver.version
              mpi-operator:
                enabled: false
                images:
                  - path: image.repository
                    tagPath: image.tag
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_three_part_composition() {
        let values = yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia/cloud-native
              image: gpu-operator-validator
              version: v25.3.4
            "#,
        );
        assert_eq!(
            validator_field().resolve(&values).as_deref(),
            Some("nvcr.io/nvidia/cloud-native/gpu-operator-validator:v25.3.4")
        );
    }

    #[test]
    fn test_default_tag_fallback() {
        let values = yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia/cloud-native
              image: gpu-operator-validator
            "#,
        );
        assert_eq!(
            validator_field().resolve(&values).as_deref(),
            Some("nvcr.io/nvidia/cloud-native/gpu-operator-validator:latest")
        );
    }

    #[test]
    fn test_two_part_composition_when_image_name_missing() {
        let values = yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia/validator
              image: ""
              version: v1
            "#,
        );
        assert_eq!(
            validator_field().resolve(&values).as_deref(),
            Some("nvcr.io/nvidia/validator:v1")
        );
    }

    #[test]
    fn test_missing_repository_is_skipped() {
        let values = yaml(
            r#"
            validator:
              image: gpu-operator-validator
              version: v25.3.4
            "#,
        );
        assert_eq!(validator_field().resolve(&values), None);

        let config = gpu_operator_config();
        assert!(config.extract("gpu-operator", &values).is_empty());
    }

    #[test]
    fn test_lookup_by_name_and_alias() {
        let config = gpu_operator_config();
        assert!(config.find("gpu-operator").is_some());
        assert!(config.find("nvidia-gpu-operator").is_some());
        assert!(config.find("ingress-nginx").is_none());
        // disabled specs are never eligible
        assert!(config.find("mpi-operator").is_none());
    }

    #[test]
    fn test_extract_all_fields() {
        let config = gpu_operator_config();
        let values = yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia/cloud-native
              image: gpu-operator-validator
              version: v25.3.4
            driver:
              repository: nvcr.io/nvidia/driver
              version: "550.90.07"
            "#,
        );
        let images = config.extract("nvidia-gpu-operator", &values);
        let expected: BTreeSet<String> = [
            "nvcr.io/nvidia/cloud-native/gpu-operator-validator:v25.3.4",
            "nvcr.io/nvidia/driver:550.90.07",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(images, expected);
    }

    #[test]
    fn test_load_operator_config_file() {
        let yaml_content = r#"
        operators:
          nfd:
            enabled: true
            images:
              - repositoryPath: image.repository
                tagPath: image.tag
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), yaml_content).expect("Failed to write to temp file");

        let mut config = load_operator_config(tmp_file.path()).expect("Should load config");
        assert_eq!(config.operators.len(), 1);
        assert_eq!(config.operators["nfd"].images[0].path, "image.repository");

        config.merge(gpu_operator_config());
        assert_eq!(config.operators.len(), 3);
    }
}
