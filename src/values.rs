use anyhow::{Context, Result};
use serde_yaml_ng::{Mapping, Value};
use std::{fs, path::Path};
use tracing::debug;

/// A chart's merged values, as parsed from YAML.
pub type ValuesTree = Value;

/// Resolves a dot-separated path (e.g. `validator.repository`) to a string.
///
/// Returns `None` when any segment is missing, an intermediate node is not a
/// map, or the final node is not a string.
pub fn lookup_str<'a>(tree: &'a ValuesTree, path: &str) -> Option<&'a str> {
    if path.is_empty() {
        return None;
    }

    let mut current = tree;
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        current = current.as_mapping()?.get(part)?;
    }
    current.as_str()
}

/// Merges `src` into `dst`. Nested maps merge recursively; any other value
/// in `src` replaces the one in `dst`.
pub fn deep_merge(dst: &mut ValuesTree, src: ValuesTree) {
    match (dst, src) {
        (Value::Mapping(dst_map), Value::Mapping(src_map)) => {
            for (key, src_val) in src_map {
                match dst_map.get_mut(&key) {
                    Some(dst_val) if dst_val.is_mapping() && src_val.is_mapping() => {
                        deep_merge(dst_val, src_val)
                    }
                    _ => {
                        dst_map.insert(key, src_val);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

pub fn empty_tree() -> ValuesTree {
    Value::Mapping(Mapping::new())
}

pub fn load_values_file<P: AsRef<Path>>(path: P) -> Result<ValuesTree> {
    let path = path.as_ref();
    debug!("Loading values file {}", path.display());
    let yaml_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read values file: {}", path.display()))?;

    // An empty or comment-only values file parses to null
    let values: ValuesTree = serde_yaml_ng::from_str(&yaml_str)
        .with_context(|| format!("Failed to parse values file: {}", path.display()))?;
    match values {
        Value::Null => Ok(empty_tree()),
        values => Ok(values),
    }
}
