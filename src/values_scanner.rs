use crate::values::ValuesTree;
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

pub const DEFAULT_MAX_DEPTH: usize = 10;
const DEFAULT_TAG: &str = "latest";

/// Recognises one way charts describe an image inside a values map.
struct ShapeRule {
    name: &'static str,
    extract: fn(&Mapping) -> Option<String>,
}

// Tried in order, first match wins for a given map.
static SHAPE_RULES: &[ShapeRule] = &[
    ShapeRule {
        name: "repository+image+tag",
        extract: repository_image_tag,
    },
    ShapeRule {
        name: "repository+tag",
        extract: repository_tag,
    },
    ShapeRule {
        name: "registry+image+tag",
        extract: registry_image_tag,
    },
    ShapeRule {
        name: "image+tag",
        extract: image_tag,
    },
    ShapeRule {
        name: "full image",
        extract: full_image,
    },
];

static SCALAR_IMAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^[a-z0-9\-\.]+/[a-z0-9\-\./_]+:[a-z0-9\-\.]+$",
        r"^[a-z0-9\-\.]+/[a-z0-9\-\./_]+@sha256:[a-f0-9]{64}$",
        r"^[a-z0-9\-\.]+/[a-z0-9\-\./_]+$",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Walks a values tree and collects every candidate image string.
///
/// Maps are matched against [`SHAPE_RULES`]; a match never prunes the
/// children, so nested images are still found. Traversal silently stops
/// below `max_depth`. Candidates are not validated here.
pub fn scan(tree: &ValuesTree, max_depth: usize) -> BTreeSet<String> {
    let mut images = BTreeSet::new();
    walk(tree, 0, max_depth, &mut images);
    images
}

fn walk(node: &Value, depth: usize, max_depth: usize, images: &mut BTreeSet<String>) {
    if depth >= max_depth {
        return;
    }

    match node {
        Value::Mapping(map) => {
            if let Some(image) = match_shape(map) {
                images.insert(image);
            }
            for value in map.values() {
                walk(value, depth + 1, max_depth, images);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                walk(item, depth + 1, max_depth, images);
            }
        }
        Value::String(s) if looks_like_image(s) => {
            images.insert(s.clone());
        }
        Value::Tagged(tagged) => walk(&tagged.value, depth, max_depth, images),
        _ => {}
    }
}

fn match_shape(map: &Mapping) -> Option<String> {
    SHAPE_RULES.iter().find_map(|rule| {
        let image = (rule.extract)(map)?;
        tracing::trace!(rule = rule.name, image = %image, "Matched values shape");
        Some(image)
    })
}

fn field<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    map.get(key)?.as_str()
}

fn tag_or_default(map: &Mapping) -> &str {
    field(map, "tag").unwrap_or(DEFAULT_TAG)
}

fn repository_image_tag(map: &Mapping) -> Option<String> {
    let repository = field(map, "repository")?;
    let image = field(map, "image")?;
    Some(format!("{}/{}:{}", repository, image, tag_or_default(map)))
}

fn repository_tag(map: &Mapping) -> Option<String> {
    let repository = field(map, "repository")?;
    let tag = field(map, "tag")?;
    Some(format!("{}:{}", repository, tag))
}

fn registry_image_tag(map: &Mapping) -> Option<String> {
    let registry = field(map, "registry")?;
    let image = field(map, "image")?;
    Some(format!("{}/{}:{}", registry, image, tag_or_default(map)))
}

fn image_tag(map: &Mapping) -> Option<String> {
    let image = field(map, "image")?;
    let tag = field(map, "tag")?;
    if image.contains(':') {
        return Some(image.to_string());
    }
    Some(format!("{}:{}", image, tag))
}

/// A lone `image` key is only trusted when it is self-contained.
fn full_image(map: &Mapping) -> Option<String> {
    let image = field(map, "image")?;
    (image.contains(':') || image.contains('@')).then(|| image.to_string())
}

fn looks_like_image(s: &str) -> bool {
    if !s.contains('/') && !s.contains(':') {
        return false;
    }
    let lower = s.to_lowercase();
    SCALAR_IMAGE_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(&lower))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> ValuesTree {
        serde_yaml_ng::from_str(s).unwrap()
    }

    fn scan_yaml(s: &str) -> BTreeSet<String> {
        scan(&yaml(s), DEFAULT_MAX_DEPTH)
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_repository_image_tag_shape() {
        let images = scan_yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia/cloud-native
              image: gpu-operator-validator
              tag: v25.3.4
            "#,
        );
        assert!(images.contains("nvcr.io/nvidia/cloud-native/gpu-operator-validator:v25.3.4"));
    }

    #[test]
    fn test_repository_image_defaults_to_latest() {
        let images = scan_yaml(
            r#"
            validator:
              repository: nvcr.io/nvidia
              image: validator
            "#,
        );
        assert!(images.contains("nvcr.io/nvidia/validator:latest"));
    }

    #[test]
    fn test_repository_tag_shape() {
        let images = scan_yaml(
            r#"
            image:
              repository: nginx
              tag: "1.19"
            "#,
        );
        assert_eq!(images, set(&["nginx:1.19"]));
    }

    #[test]
    fn test_registry_image_shape() {
        let images = scan_yaml(
            r#"
            image:
              registry: docker.io
              image: bitnami/postgresql
              tag: "16.1.0"
            "#,
        );
        // the image+tag shape must not fire on the same map
        assert_eq!(
            images,
            set(&["bitnami/postgresql", "docker.io/bitnami/postgresql:16.1.0"])
        );
        assert!(!images.contains("bitnami/postgresql:16.1.0"));
    }

    #[test]
    fn test_registry_image_defaults_to_latest() {
        let images = scan_yaml(
            r#"
            image:
              registry: ghcr.io
              image: org/app
            "#,
        );
        assert!(images.contains("ghcr.io/org/app:latest"));
    }

    #[test]
    fn test_image_tag_shape() {
        let images = scan_yaml(
            r#"
            controller:
              image: ingress-nginx/controller
              tag: v1.13.2
            sidecar:
              image: busybox:1.36
              tag: ignored
            "#,
        );
        assert!(images.contains("ingress-nginx/controller:v1.13.2"));
        assert!(images.contains("busybox:1.36"));
        assert!(!images.iter().any(|image| image.contains("ignored")));
    }

    #[test]
    fn test_lone_image_requires_version() {
        let images = scan_yaml(
            r#"
            a:
              image: redis:7.2
            b:
              image: postgres
            "#,
        );
        assert_eq!(images, set(&["redis:7.2"]));
    }

    #[test]
    fn test_lone_image_with_digest() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let image = format!("quay.io/org/app@{}", digest);
        let images = scan_yaml(&format!("exporter:\n  image: {}\n", image));
        assert_eq!(images, set(&[image.as_str()]));
    }

    #[test]
    fn test_non_string_tag_does_not_match() {
        let images = scan_yaml(
            r#"
            image:
              repository: nginx
              tag: 1.19
            "#,
        );
        assert!(images.is_empty());
    }

    #[test]
    fn test_nested_matches_are_all_kept() {
        let images = scan_yaml(
            r#"
            image:
              repository: quay.io/app/server
              tag: v1
              sidecar:
                repository: quay.io/app/sidecar
                tag: v2
            workers:
              - image:
                  repository: quay.io/app/worker
                  tag: v3
            "#,
        );
        assert!(images.contains("quay.io/app/server:v1"));
        assert!(images.contains("quay.io/app/sidecar:v2"));
        assert!(images.contains("quay.io/app/worker:v3"));
    }

    #[test]
    fn test_scalar_strings() {
        let images = scan_yaml(
            r#"
            reloader: quay.io/prometheus-operator/prometheus-config-reloader:v0.75.2
            pinned: docker.io/library/nginx@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
            bare: docker.io/nginx
            plain: nginx
            url: https://example.com/charts
            sentence: see docs/README for details
            "#,
        );
        assert!(images.contains("quay.io/prometheus-operator/prometheus-config-reloader:v0.75.2"));
        assert!(images.iter().any(|image| image.contains("@sha256:")));
        assert!(images.contains("docker.io/nginx"));
        assert!(!images.contains("nginx"));
        assert!(!images.iter().any(|image| image.starts_with("https://")));
        assert!(!images.iter().any(|image| image.contains(' ')));
    }

    #[test]
    fn test_max_depth_stops_traversal() {
        let tree = yaml(
            r#"
            a:
              b:
                c:
                  image: quay.io/deep/image:v1
            "#,
        );
        // root map is depth 0, `c` map is depth 3
        assert!(scan(&tree, 3).is_empty());
        assert_eq!(scan(&tree, 4), set(&["quay.io/deep/image:v1"]));
    }
}
