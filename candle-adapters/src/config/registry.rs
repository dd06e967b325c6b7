//! Named config registry
//!
//! Resolves names, JSON documents and built values to shared config values.
//! Anonymous configs are keyed by their content hash so that every injection
//! point asking for the same logical config gets the same entry.

use super::adapter_config::{config_hash, AdapterConfig, BottleneckConfig, LoRAConfig, PrefixTuningConfig};
use super::fusion_config::AdapterFusionConfig;
use crate::core::{lookup_errors, AdapterError, AdapterResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

pub const DEFAULT_ADAPTER_CONFIG: &str = "pfeiffer";
pub const DEFAULT_ADAPTERFUSION_CONFIG: &str = "dynamic";

/// A config type that can live in a [`ConfigRegistry`]
pub trait NamedConfig: Clone + PartialEq + Debug + Serialize + DeserializeOwned {
    /// Human readable kind, used in log and error messages
    const KIND: &'static str;

    fn presets() -> Vec<(&'static str, Self)>;

    fn default_name() -> &'static str;

    /// Parse a JSON object, filling missing fields with defaults
    fn from_json_value(value: Value) -> AdapterResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn validate(&self) -> AdapterResult<()> {
        Ok(())
    }
}

impl NamedConfig for AdapterConfig {
    const KIND: &'static str = "adapter";

    fn presets() -> Vec<(&'static str, Self)> {
        vec![
            ("pfeiffer", BottleneckConfig::pfeiffer().into()),
            ("houlsby", BottleneckConfig::houlsby().into()),
            ("pfeiffer+inv", BottleneckConfig::pfeiffer_inv().into()),
            ("houlsby+inv", BottleneckConfig::houlsby_inv().into()),
            ("compacter", BottleneckConfig::compacter().into()),
            ("compacter++", BottleneckConfig::compacter_plus_plus().into()),
            ("lora", LoRAConfig::default().into()),
            ("ia3", LoRAConfig::ia3().into()),
            ("prefix_tuning", PrefixTuningConfig::default().into()),
        ]
    }

    fn default_name() -> &'static str {
        DEFAULT_ADAPTER_CONFIG
    }

    fn from_json_value(mut value: Value) -> AdapterResult<Self> {
        // Documents without an architecture tag describe bottleneck adapters
        if let Value::Object(map) = &mut value {
            map.entry("architecture")
                .or_insert_with(|| Value::String("bottleneck".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    fn validate(&self) -> AdapterResult<()> {
        AdapterConfig::validate(self)
    }
}

impl NamedConfig for AdapterFusionConfig {
    const KIND: &'static str = "fusion";

    fn presets() -> Vec<(&'static str, Self)> {
        vec![
            ("static", AdapterFusionConfig::static_fusion()),
            ("dynamic", AdapterFusionConfig::dynamic()),
        ]
    }

    fn default_name() -> &'static str {
        DEFAULT_ADAPTERFUSION_CONFIG
    }
}

/// Where a config comes from
#[derive(Debug, Clone)]
pub enum ConfigSource<T> {
    /// Registered name, preset name or known hash
    Name(String),
    /// JSON text: a string literal is a name, an object is a config body
    Json(String),
    /// Already built value
    Config(T),
}

impl<T> From<&str> for ConfigSource<T> {
    fn from(name: &str) -> Self {
        ConfigSource::Name(name.to_string())
    }
}

impl<T> From<String> for ConfigSource<T> {
    fn from(name: String) -> Self {
        ConfigSource::Name(name)
    }
}

impl From<AdapterConfig> for ConfigSource<AdapterConfig> {
    fn from(config: AdapterConfig) -> Self {
        ConfigSource::Config(config)
    }
}

impl From<BottleneckConfig> for ConfigSource<AdapterConfig> {
    fn from(config: BottleneckConfig) -> Self {
        ConfigSource::Config(config.into())
    }
}

impl From<LoRAConfig> for ConfigSource<AdapterConfig> {
    fn from(config: LoRAConfig) -> Self {
        ConfigSource::Config(config.into())
    }
}

impl From<PrefixTuningConfig> for ConfigSource<AdapterConfig> {
    fn from(config: PrefixTuningConfig) -> Self {
        ConfigSource::Config(config.into())
    }
}

impl From<AdapterFusionConfig> for ConfigSource<AdapterFusionConfig> {
    fn from(config: AdapterFusionConfig) -> Self {
        ConfigSource::Config(config)
    }
}

/// Name and hash keyed store of shared configs
#[derive(Debug, Clone)]
pub struct ConfigRegistry<T: NamedConfig> {
    presets: BTreeMap<String, Arc<T>>,
    /// Explicitly registered names and cached anonymous hashes
    entries: BTreeMap<String, Arc<T>>,
}

impl<T: NamedConfig> Default for ConfigRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: NamedConfig> ConfigRegistry<T> {
    pub fn new() -> Self {
        let presets = T::presets()
            .into_iter()
            .map(|(name, config)| (name.to_string(), Arc::new(config)))
            .collect();
        Self {
            presets,
            entries: BTreeMap::new(),
        }
    }

    /// Look up a registered name, a preset or a cached hash
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .get(name)
            .or_else(|| self.presets.get(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.presets.contains_key(name)
    }

    pub fn is_preset(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    /// Register `config` under `name`. Re-registering identical content is accepted.
    pub fn register(&mut self, name: &str, config: T) -> AdapterResult<Arc<T>> {
        config.validate()?;
        if let Some(existing) = self.get(name) {
            if *existing == config {
                return Ok(existing);
            }
            return Err(AdapterError::Conflict {
                name: name.to_string(),
                reason: format!("a different {} config is already registered under this name", T::KIND),
            });
        }
        let config = Arc::new(config);
        self.entries.insert(name.to_string(), config.clone());
        tracing::debug!(name, kind = T::KIND, "registered config");
        Ok(config)
    }

    /// Resolve a source to its registry key and shared value
    pub fn resolve(&mut self, source: ConfigSource<T>) -> AdapterResult<(String, Arc<T>)> {
        match source {
            ConfigSource::Name(name) => self.resolve_name(&name),
            ConfigSource::Json(text) => match serde_json::from_str::<Value>(&text)? {
                Value::String(name) => self.resolve_name(&name),
                Value::Null => self.resolve_name(T::default_name()),
                value @ Value::Object(_) => {
                    let config = T::from_json_value(value)?;
                    self.resolve_anonymous(config)
                }
                other => Err(AdapterError::Serialization {
                    operation: format!("{} config resolution", T::KIND),
                    reason: format!("expected a name or an object, got {}", other),
                }),
            },
            ConfigSource::Config(config) => self.resolve_anonymous(config),
        }
    }

    fn resolve_name(&self, name: &str) -> AdapterResult<(String, Arc<T>)> {
        self.get(name)
            .map(|config| (name.to_string(), config))
            .ok_or_else(|| lookup_errors::unknown_config(name))
    }

    /// Equal content reuses the existing name, otherwise the content hash becomes the key
    fn resolve_anonymous(&mut self, config: T) -> AdapterResult<(String, Arc<T>)> {
        config.validate()?;
        let existing = self
            .entries
            .iter()
            .chain(self.presets.iter())
            .find(|(_, known)| ***known == config)
            .map(|(name, known)| (name.clone(), known.clone()));
        if let Some(found) = existing {
            return Ok(found);
        }
        let key = config_hash(&config)?;
        // Equal content was matched above, so a taken key holds different content
        if self.contains(&key) {
            return Err(AdapterError::Conflict {
                name: key,
                reason: format!("config hash collides with a different registered {} config", T::KIND),
            });
        }
        let config = Arc::new(config);
        self.entries.insert(key.clone(), config.clone());
        tracing::debug!(key = %key, kind = T::KIND, "cached anonymous config");
        Ok((key, config))
    }

    /// Registered and cached entries, presets excluded
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Arc<T>)> {
        self.entries.iter()
    }

    pub fn to_json(&self) -> AdapterResult<Value> {
        let map: BTreeMap<&String, &T> = self.entries.iter().map(|(k, v)| (k, v.as_ref())).collect();
        Ok(serde_json::to_value(map)?)
    }
}
