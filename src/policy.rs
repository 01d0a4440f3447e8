use crate::extractor::ImageSet;
use crate::image_reference::{ImageReference, is_candidate, is_registry_host};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info};

const K8S_REGISTRY: &str = "registry.k8s.io";
const K8S_REGISTRY_PATHS: &[&str] = &["/sig-storage/", "/sig-release/", "/metrics-server/"];
const K8S_CORE_IMAGES: &[&str] = &["pause", "etcd", "coredns"];
const K8S_CORE_IMAGE_PREFIX: &str = "defaultbackend";

static EXCLUDE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("missing registry", r"^/"),
        ("incomplete reference", r"[:/]$"),
        ("metadata line", r"^(description|metadata|labels?):"),
        (
            "label namespace",
            r"^(kubernetes\.io|k8s\.io|nvidia\.com|node\.kubernetes\.io|node-role\.kubernetes\.io)/",
        ),
        ("crd group", r"^keda\.sh/"),
        ("api version", r"^[a-z0-9-]+\.[a-z]+/v\d+[a-z]+\d*$"),
    ]
    .into_iter()
    .map(|(reason, pattern)| (reason, Regex::new(pattern).unwrap()))
    .collect()
});

// [host:port/]segment(/segment)*[:tag][@sha256:digest]
static VALID_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:[a-zA-Z0-9]([a-zA-Z0-9.-]*[a-zA-Z0-9])?:[0-9]+/)?",
        r"[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?",
        r"(/[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?)*",
        r"(:[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?",
        r"(@sha256:[a-fA-F0-9]{64})?$",
    ))
    .unwrap()
});

/// One step of the chain. Passes are pure functions of the image set.
pub trait PolicyPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, images: ImageSet) -> ImageSet;
}

/// A superseded vendor namespace and the namespace now published instead,
/// e.g. `bitnami` replaced by `bitnamilegacy`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyNamespace {
    pub original: String,
    pub replacement: String,
}

/// A custom image whose presence makes a vendor default redundant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageOverride {
    pub custom: String,
    pub replaces: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub legacy_namespaces: Vec<LegacyNamespace>,
    pub overrides: Vec<ImageOverride>,
    /// Glob patterns over final image references
    pub exclusions: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            legacy_namespaces: vec![LegacyNamespace {
                original: "bitnami".to_string(),
                replacement: "bitnamilegacy".to_string(),
            }],
            overrides: vec![ImageOverride {
                custom: "xiilab/astrago-keycloak-theme".to_string(),
                replaces: "bitnami/keycloak".to_string(),
            }],
            exclusions: vec!["*/prometheus-community/windows-exporter:*".to_string()],
        }
    }
}

/// The ordered list of passes turning raw candidates into the final set.
pub struct PolicyChain {
    passes: Vec<Box<dyn PolicyPass>>,
}

impl PolicyChain {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            passes: vec![
                Box::new(Validate),
                Box::new(Normalize),
                Box::new(DropUntaggedDuplicates),
                Box::new(ReplaceLegacyNamespaces {
                    rules: config.legacy_namespaces.clone(),
                }),
                Box::new(SuppressOverridden {
                    rules: config.overrides.clone(),
                }),
                Box::new(ExcludeImages::new(&config.exclusions)?),
            ],
        })
    }

    pub fn apply(&self, images: ImageSet) -> ImageSet {
        self.passes.iter().fold(images, |images, pass| {
            let before = images.len();
            let images = pass.apply(images);
            debug!(pass = pass.name(), before, after = images.len(), "Applied policy pass");
            images
        })
    }
}

pub struct Validate;

impl PolicyPass for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        let before = images.len();
        let valid: ImageSet = images
            .into_iter()
            .filter(|image| match rejection_reason(image) {
                Some(reason) => {
                    debug!(image = %image, reason, "Dropping image candidate");
                    false
                }
                None => true,
            })
            .collect();

        let filtered = before - valid.len();
        if filtered > 0 {
            info!("Dropped {} invalid image candidates", filtered);
        }
        valid
    }
}

/// Why a candidate is not a pullable, pinned image reference.
pub fn rejection_reason(image: &str) -> Option<&'static str> {
    if image.trim().is_empty() {
        return Some("empty");
    }
    if !is_candidate(image) {
        return Some("not an image");
    }
    if let Some((reason, _)) = EXCLUDE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(image))
    {
        return Some(reason);
    }
    if !VALID_IMAGE.is_match(image) {
        return Some("invalid format");
    }

    let Ok(reference) = ImageReference::parse(image) else {
        return Some("invalid format");
    };
    // an implicit :latest cannot be pulled reproducibly offline
    if !reference.is_pinned() {
        return Some("no tag or digest");
    }
    if reference.registry.as_deref() == Some("nvcr.io") && reference.repository == "nvidia" {
        return Some("registry organisation");
    }
    None
}

pub struct Normalize;

impl PolicyPass for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        images.iter().map(|image| normalize_image(image)).collect()
    }
}

/// Fully qualifies a reference with its registry.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();

    if K8S_REGISTRY_PATHS.iter().any(|path| image.starts_with(path)) {
        return format!("{}{}", K8S_REGISTRY, image);
    }

    match image.split_once('/') {
        Some((first, _)) if is_registry_host(first) => image.to_string(),
        Some(_) => format!("docker.io/{}", image),
        None if is_k8s_core_image(image) => format!("{}/{}", K8S_REGISTRY, image),
        None => format!("docker.io/library/{}", image),
    }
}

fn is_k8s_core_image(image: &str) -> bool {
    let name = image.split([':', '@']).next().unwrap_or(image);
    K8S_CORE_IMAGES.contains(&name) || name.starts_with(K8S_CORE_IMAGE_PREFIX)
}

pub struct DropUntaggedDuplicates;

impl PolicyPass for DropUntaggedDuplicates {
    fn name(&self) -> &'static str {
        "drop-untagged-duplicates"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        let pinned: HashSet<String> = images
            .iter()
            .filter_map(|image| ImageReference::parse(image).ok())
            .filter(ImageReference::is_pinned)
            .map(|reference| reference.name())
            .collect();

        images
            .into_iter()
            .filter(|image| match ImageReference::parse(image) {
                Ok(reference) if !reference.is_pinned() && pinned.contains(image) => {
                    debug!(image = %image, "Dropping untagged image, a pinned version exists");
                    false
                }
                _ => true,
            })
            .collect()
    }
}

pub struct ReplaceLegacyNamespaces {
    rules: Vec<LegacyNamespace>,
}

impl PolicyPass for ReplaceLegacyNamespaces {
    fn name(&self) -> &'static str {
        "replace-legacy-namespaces"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        let superseded: HashSet<String> = images
            .iter()
            .flat_map(|image| {
                self.rules.iter().filter_map(move |rule| {
                    swap_segment(image, &rule.replacement, &rule.original)
                })
            })
            .collect();

        images
            .into_iter()
            .filter(|image| {
                let keep = !superseded.contains(image);
                if !keep {
                    debug!(image = %image, "Dropping image superseded by its legacy namespace");
                }
                keep
            })
            .collect()
    }
}

/// Replaces the first path segment equal to `from` with `to`.
fn swap_segment(image: &str, from: &str, to: &str) -> Option<String> {
    let mut segments: Vec<&str> = image.split('/').collect();
    let last = segments.len().checked_sub(1)?;
    let pos = segments[..last].iter().position(|segment| *segment == from)?;
    segments[pos] = to;
    Some(segments.join("/"))
}

pub struct SuppressOverridden {
    rules: Vec<ImageOverride>,
}

impl PolicyPass for SuppressOverridden {
    fn name(&self) -> &'static str {
        "suppress-overridden"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        let references: Vec<ImageReference> = images
            .iter()
            .filter_map(|image| ImageReference::parse(image).ok())
            .collect();

        let suppressed: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| {
                references
                    .iter()
                    .any(|reference| repository_matches(reference, &rule.custom))
            })
            .map(|rule| rule.replaces.as_str())
            .collect();
        if suppressed.is_empty() {
            return images;
        }

        images
            .into_iter()
            .filter(|image| {
                let Ok(reference) = ImageReference::parse(image) else {
                    return true;
                };
                let keep = !suppressed
                    .iter()
                    .any(|name| repository_matches(&reference, name));
                if !keep {
                    debug!(image = %image, "Dropping vendor image replaced by a custom image");
                }
                keep
            })
            .collect()
    }
}

fn repository_matches(reference: &ImageReference, name: &str) -> bool {
    reference.repository == name
        || reference
            .repository
            .strip_suffix(name)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

pub struct ExcludeImages {
    globs: GlobSet,
}

impl ExcludeImages {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid image exclusion pattern: {}", pattern))?,
            );
        }
        Ok(Self {
            globs: builder.build().context("Failed to build image exclusion set")?,
        })
    }
}

impl PolicyPass for ExcludeImages {
    fn name(&self) -> &'static str {
        "exclude"
    }

    fn apply(&self, images: ImageSet) -> ImageSet {
        images
            .into_iter()
            .filter(|image| {
                let keep = !self.globs.is_match(image);
                if !keep {
                    debug!(image = %image, "Dropping excluded image");
                }
                keep
            })
            .collect()
    }
}
