use crate::image_reference::is_candidate;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Container flags known to carry a full image reference as their value.
const IMAGE_FLAGS: &[&str] = &["prometheus-config-reloader"];

/// One text pattern run over every rendered document.
struct ManifestPattern {
    name: &'static str,
    regex: Regex,
    /// Heuristic patterns only trust captures that already carry a tag or digest.
    requires_version: bool,
    accept: fn(&str) -> bool,
}

impl ManifestPattern {
    fn new(name: &'static str, pattern: &str, requires_version: bool) -> Self {
        Self::with_accept(name, pattern, requires_version, |_| true)
    }

    fn with_accept(
        name: &'static str,
        pattern: &str,
        requires_version: bool,
        accept: fn(&str) -> bool,
    ) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).unwrap(),
            requires_version,
            accept,
        }
    }
}

static DOCUMENT_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*---[ \t]*$").unwrap());

static KIND_FIELD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*kind:").unwrap());

static PATTERNS: LazyLock<Vec<ManifestPattern>> = LazyLock::new(|| {
    vec![
        ManifestPattern::new(
            "standard_image",
            r#"(?m)^\s*(?:-\s+)?image:\s*["']?([^\s"']+)["']?"#,
            false,
        ),
        ManifestPattern::with_accept(
            "custom_image_field",
            r#"(?m)^\s*[a-zA-Z]+[Ii]mage:\s*["']?([^\s"']+)["']?"#,
            true,
            |candidate| candidate.contains('/') || candidate.contains(':'),
        ),
        ManifestPattern::new(
            "repository_field",
            r#"(?m)^\s*repository:\s*["']?([a-z0-9\-\.]+/[^\s"']+)["']?"#,
            true,
        ),
        ManifestPattern::new(
            "value_field",
            r#"(?m)^\s*(?:value|defaultValue):\s*["']?([a-z0-9\-\.]+/[^\s"']+)["']?"#,
            true,
        ),
        ManifestPattern::with_accept(
            "list_item",
            r#"(?m)^\s*-\s+["']?([a-z0-9\-\.]+/[^\s"':]+:[^\s"']+)["']?"#,
            true,
            |candidate| candidate.contains('/') && !candidate.starts_with("http"),
        ),
        ManifestPattern::new(
            "env_var",
            r#"(?m)^\s*-\s+name:\s+["']?[A-Z_]+IMAGE[A-Z_]*["']?\s+value:\s*["']?([^\s"']+)["']?"#,
            true,
        ),
        ManifestPattern::new(
            "flag_argument",
            &flag_pattern(IMAGE_FLAGS),
            true,
        ),
        ManifestPattern::new(
            "embedded_block",
            r"(?m)^\s*[a-z0-9\-\.]+:\s*\|[-+]?\s*\n\s+([a-z0-9\-\.]+/[^\s]+:[^\s]+)",
            true,
        ),
    ]
});

/// `--<flag>=<value>` for any of `flags`, taken literally.
fn flag_pattern(flags: &[&str]) -> String {
    let alternatives: Vec<String> = flags.iter().map(|flag| regex::escape(flag)).collect();
    format!(r#"--(?:{})=([^\s"']+)"#, alternatives.join("|"))
}

/// Recovers candidate image references from rendered multi-document YAML.
///
/// Documents without a `kind:` field are not Kubernetes resources and are
/// skipped. Every pattern runs over every remaining document and the
/// results are unioned.
pub fn scan(manifest: &str) -> BTreeSet<String> {
    let mut images = BTreeSet::new();

    for document in DOCUMENT_SEPARATOR.split(manifest) {
        if !KIND_FIELD.is_match(document) {
            continue;
        }
        scan_document(document, &mut images);
    }

    images
}

fn scan_document(document: &str, images: &mut BTreeSet<String>) {
    for pattern in PATTERNS.iter() {
        for captures in pattern.regex.captures_iter(document) {
            let Some(raw) = captures.get(1) else {
                continue;
            };
            let candidate = raw.as_str().trim_matches(|c| c == '"' || c == '\'');

            if !(pattern.accept)(candidate) {
                continue;
            }
            if pattern.requires_version && !candidate.contains(':') && !candidate.contains('@') {
                continue;
            }
            if is_candidate(candidate) {
                tracing::trace!(pattern = pattern.name, image = candidate, "Matched manifest line");
                images.insert(candidate.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_standard_image_fields() {
        let manifest = r#"
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: web
          image: nginx:1.19
        - name: cache
          image: "redis:6.2"
      initContainers:
        - image: 'busybox:1.36'
        - image: busybox
"#;
        assert_eq!(
            scan(manifest),
            set(&["busybox:1.36", "nginx:1.19", "redis:6.2"])
        );
    }

    #[test]
    fn test_document_without_kind_is_skipped() {
        let manifest = r#"
apiVersion: v2
name: mychart
image: quay.io/stray/metadata:v1
---
apiVersion: v1
kind: Pod
spec:
  containers:
    - name: app
      image: quay.io/real/app:v2
"#;
        assert_eq!(scan(manifest), set(&["quay.io/real/app:v2"]));
    }

    #[test]
    fn test_separator_tolerates_whitespace() {
        let manifest = "kind: Pod\nimage: a/b:1\n  ---  \nkind: Pod\nimage: c/d:2\n";
        assert_eq!(scan(manifest), set(&["a/b:1", "c/d:2"]));
    }

    #[test]
    fn test_custom_image_fields() {
        let manifest = r#"
kind: Keycloak
spec:
  themeImage: docker.io/xiilab/astrago-keycloak-theme:v1.0.0
  pullImage: always
  baseImage: quay.io/base/image
"#;
        // `baseImage` has no version and the standard pattern does not apply to it
        assert_eq!(
            scan(manifest),
            set(&["docker.io/xiilab/astrago-keycloak-theme:v1.0.0"])
        );
    }

    #[test]
    fn test_repository_field_requires_version() {
        let manifest = r#"
kind: ConfigMap
data:
  repository: ghcr.io/org/tool:v3
  other:
    repository: ghcr.io/org/untagged
"#;
        assert_eq!(scan(manifest), set(&["ghcr.io/org/tool:v3"]));
    }

    #[test]
    fn test_value_fields() {
        let manifest = r#"
kind: Deployment
spec:
  containers:
    - name: op
      env:
        - name: SOMETHING
          value: quay.io/org/helper:v1.2
        - name: PLAIN
          value: some/path
      parameters:
        - name: agent
          defaultValue: "registry.example.com/team/agent:2.0"
"#;
        let images = scan(manifest);
        assert!(images.contains("quay.io/org/helper:v1.2"));
        assert!(images.contains("registry.example.com/team/agent:2.0"));
        assert!(!images.contains("some/path"));
    }

    #[test]
    fn test_list_items() {
        let manifest = r#"
kind: ConfigMap
data:
  images:
    - "docker.io/library/alpine:3.20"
    - http://example.com/not:image
    - plain-entry
"#;
        assert_eq!(scan(manifest), set(&["docker.io/library/alpine:3.20"]));
    }

    #[test]
    fn test_env_var_image() {
        let manifest = r#"
kind: Deployment
spec:
  containers:
    - name: operator
      env:
        - name: DRIVER_IMAGE
          value: "nvcr.io/nvidia/driver:550.90.07"
        - name: VALIDATOR_IMAGE_NAME
          value: validator
"#;
        assert_eq!(scan(manifest), set(&["nvcr.io/nvidia/driver:550.90.07"]));
    }

    #[test]
    fn test_flag_argument() {
        let manifest = r#"
kind: Deployment
spec:
  containers:
    - name: operator
      args:
        - --kubelet-service=kube-system/kubelet
        - --prometheus-config-reloader=quay.io/prometheus-operator/prometheus-config-reloader:v0.75.2
"#;
        assert_eq!(
            scan(manifest),
            set(&["quay.io/prometheus-operator/prometheus-config-reloader:v0.75.2"])
        );
    }

    #[test]
    fn test_flag_names_match_literally() {
        let regex = Regex::new(&flag_pattern(&["image.reloader", "sidecar+image"])).unwrap();
        assert!(regex.is_match("--image.reloader=quay.io/org/reloader:v1"));
        assert!(regex.is_match("--sidecar+image=quay.io/org/sidecar:v1"));
        assert!(!regex.is_match("--imageXreloader=quay.io/org/reloader:v1"));
        assert!(!regex.is_match("--sidecarrimage=quay.io/org/sidecar:v1"));
    }

    #[test]
    fn test_embedded_block() {
        let manifest = r#"
kind: ConfigMap
data:
  image.txt: |
    registry.k8s.io/sig-storage/csi-snapshotter:v8.0.1
  notes: |
    see the docs for details
"#;
        assert_eq!(
            scan(manifest),
            set(&["registry.k8s.io/sig-storage/csi-snapshotter:v8.0.1"])
        );
    }
}
