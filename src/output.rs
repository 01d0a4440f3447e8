use crate::extractor::ImageSet;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("images.txt"),
            format: OutputFormat::Text,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageList<'a> {
    images: Vec<&'a str>,
    count: usize,
}

/// Renders the image list, sorted ascending. Text output is one image per
/// line, newline terminated.
pub fn render(images: &ImageSet, format: OutputFormat) -> Result<String> {
    // BTreeSet iterates in ascending order
    let sorted: Vec<&str> = images.iter().map(String::as_str).collect();

    match format {
        OutputFormat::Text => Ok(sorted.iter().map(|image| format!("{}\n", image)).collect()),
        OutputFormat::Json => {
            let list = ImageList {
                count: sorted.len(),
                images: sorted,
            };
            let mut json =
                serde_json::to_string_pretty(&list).context("Failed to serialize image list")?;
            json.push('\n');
            Ok(json)
        }
        OutputFormat::Yaml => {
            let list = ImageList {
                count: sorted.len(),
                images: sorted,
            };
            serde_yaml_ng::to_string(&list).context("Failed to serialize image list")
        }
    }
}

/// Writes the image list, creating missing parent directories.
pub fn write_images<P: AsRef<Path>>(images: &ImageSet, path: P, format: OutputFormat) -> Result<()> {
    let path = path.as_ref();
    let content = render(images, format)?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    fs::write(path, content)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;

    info!("Wrote {} images to {} ({:?})", images.len(), path.display(), format);
    Ok(())
}
