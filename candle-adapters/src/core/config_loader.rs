//! Bundle Configuration Loader
//!
//! Reads and writes the directory bundles used to persist adapters, fusion
//! layers and prediction heads: one JSON document plus one safetensors file
//! per bundle.

use crate::core::unified_error::{bundle_errors, AdapterError, AdapterResult};
use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

pub const ADAPTER_CONFIG_NAME: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_NAME: &str = "adapter_model.safetensors";
pub const FUSION_CONFIG_NAME: &str = "adapter_fusion_config.json";
pub const FUSION_WEIGHTS_NAME: &str = "adapter_fusion.safetensors";
pub const HEAD_CONFIG_NAME: &str = "head_config.json";
pub const HEAD_WEIGHTS_NAME: &str = "head_model.safetensors";

/// Key segments that are followed by an adapter name in a parameter key
pub const ADAPTER_GROUP_MARKERS: &[&str] = &[
    "loras",
    "adapters",
    "prefix_tunings",
    "invertible_adapters",
    "heads",
];

/// Key segment followed by the comma-joined adapter names of a fusion layer
pub const FUSION_GROUP_MARKER: &str = "adapter_fusion_layer";

/// Loader for adapter, fusion and head bundles
pub struct BundleLoader;

impl BundleLoader {
    /// Load and parse a JSON document `file` inside the bundle directory
    pub fn load_json_config<T: DeserializeOwned>(dir: &Path, file: &str) -> AdapterResult<T> {
        let config_path = dir.join(file);
        let display = config_path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| bundle_errors::file_not_found(&display, e))?;

        serde_json::from_str(&content).map_err(|e| bundle_errors::invalid_json(&display, &e.to_string()))
    }

    /// Write `value` as pretty JSON to `file`, creating the directory if needed
    pub fn save_json_config<T: Serialize>(dir: &Path, file: &str, value: &T) -> AdapterResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| AdapterError::IO {
            operation: "bundle directory creation".to_string(),
            path: Some(dir.to_string_lossy().to_string()),
            source: e,
        })?;
        let content = serde_json::to_string_pretty(value)?;
        let config_path = dir.join(file);
        std::fs::write(&config_path, content).map_err(|e| AdapterError::IO {
            operation: "bundle config write".to_string(),
            path: Some(config_path.to_string_lossy().to_string()),
            source: e,
        })
    }

    /// Save named tensors to a safetensors file inside the bundle directory
    pub fn save_weights(dir: &Path, file: &str, tensors: &HashMap<String, Tensor>) -> AdapterResult<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(file);
        candle_core::safetensors::save(tensors, &path).map_err(|e| AdapterError::External {
            library: "candle-core".to_string(),
            operation: format!("safetensors save to {}", path.to_string_lossy()),
            error: e.to_string(),
        })
    }

    /// Load every tensor of a safetensors file onto `device`
    pub fn load_weights(dir: &Path, file: &str, device: &Device) -> AdapterResult<HashMap<String, Tensor>> {
        let path = dir.join(file);
        if !path.exists() {
            return Err(bundle_errors::file_not_found(
                &path.to_string_lossy(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "weights file not found"),
            ));
        }
        candle_core::safetensors::load(&path, device).map_err(|e| AdapterError::External {
            library: "candle-core".to_string(),
            operation: format!("safetensors load from {}", path.to_string_lossy()),
            error: e.to_string(),
        })
    }

    /// Check whether a bundle directory holds the given config file
    pub fn has_bundle(dir: &Path, config_file: &str) -> bool {
        dir.join(config_file).is_file()
    }
}

/// Rename the adapter name inside every parameter key from `old_name` to `new_name`.
///
/// The name is matched only directly after a group marker, as a whole
/// `<marker>.<name>.` run, so layer path segments that happen to equal the
/// adapter name (e.g. `self`) are left alone and names containing dots are
/// handled. Fusion keys are renamed per member of the comma-joined name list.
pub fn rename_adapter_keys(
    weights: HashMap<String, Tensor>,
    old_name: &str,
    new_name: &str,
) -> HashMap<String, Tensor> {
    if old_name == new_name {
        return weights;
    }
    weights
        .into_iter()
        .map(|(key, tensor)| (rename_key(&key, old_name, new_name), tensor))
        .collect()
}

/// Byte offset of `needle` in `key` where it starts a dotted segment
fn find_at_segment(key: &str, needle: &str) -> Option<usize> {
    key.match_indices(needle)
        .map(|(pos, _)| pos)
        .find(|&pos| pos == 0 || key.as_bytes()[pos - 1] == b'.')
}

fn rename_key(key: &str, old_name: &str, new_name: &str) -> String {
    for marker in ADAPTER_GROUP_MARKERS {
        let needle = format!("{}.{}.", marker, old_name);
        if let Some(pos) = find_at_segment(key, &needle) {
            return format!("{}{}.{}.{}", &key[..pos], marker, new_name, &key[pos + needle.len()..]);
        }
    }

    let marker = format!("{}.", FUSION_GROUP_MARKER);
    let Some(pos) = find_at_segment(key, &marker) else {
        return key.to_string();
    };
    let (head, rest) = key.split_at(pos + marker.len());
    // Members before the last comma are complete; the last one ends at the
    // first dot unless it is the (possibly dotted) name being renamed.
    let mut members: Vec<&str> = rest.split(',').collect();
    let last = members.pop().unwrap_or_default();
    let (last_member, local) = match last.strip_prefix(old_name).and_then(|r| r.strip_prefix('.')) {
        Some(local) => (old_name, local),
        None => last.split_once('.').unwrap_or((last, "")),
    };
    members.push(last_member);
    let renamed: Vec<&str> = members
        .into_iter()
        .map(|member| if member == old_name { new_name } else { member })
        .collect();
    if local.is_empty() {
        format!("{}{}", head, renamed.join(","))
    } else {
        format!("{}{}.{}", head, renamed.join(","), local)
    }
}

/// Collect tensors whose key starts with `prefix`, keyed by the remainder
pub fn extract_prefixed(weights: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    weights
        .iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(prefix)
                .map(|local| (local.to_string(), tensor.clone()))
        })
        .collect()
}
