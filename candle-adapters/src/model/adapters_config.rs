//! Model-wide adapter registry
//!
//! Maps adapter and fusion names to config keys in two [`ConfigRegistry`]s
//! and holds the active composition.

use crate::composition::{fusion_name_of, AdapterCompositionBlock};
use crate::config::{AdapterConfig, AdapterFusionConfig, ConfigRegistry, ConfigSource};
use crate::core::{AdapterError, AdapterResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ModelAdaptersConfig {
    /// adapter name → config key
    adapters: BTreeMap<String, String>,
    config_map: ConfigRegistry<AdapterConfig>,
    /// fusion name → fusion config key
    fusions: BTreeMap<String, String>,
    fusion_config_map: ConfigRegistry<AdapterFusionConfig>,
    active_setup: Option<AdapterCompositionBlock>,
}

impl ModelAdaptersConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with the resolved config
    pub fn add(&mut self, name: &str, source: ConfigSource<AdapterConfig>) -> AdapterResult<Arc<AdapterConfig>> {
        if self.adapters.contains_key(name) {
            return Err(AdapterError::Conflict {
                name: name.to_string(),
                reason: "an adapter with this name has already been added".to_string(),
            });
        }
        let (key, config) = self.config_map.resolve(source)?;
        self.adapters.insert(name.to_string(), key);
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AdapterConfig>> {
        self.adapters.get(name).and_then(|key| self.config_map.get(key))
    }

    /// Registry key the adapter's config is stored under
    pub fn config_key(&self, name: &str) -> Option<&str> {
        self.adapters.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<AdapterConfig>> {
        let config = self.get(name);
        self.adapters.remove(name);
        config
    }

    /// Register a named config so adapters can refer to it by name
    pub fn register_config(&mut self, name: &str, config: AdapterConfig) -> AdapterResult<Arc<AdapterConfig>> {
        self.config_map.register(name, config)
    }

    /// Register a fusion over `adapter_names`; returns its sorted, comma-joined name
    pub fn add_fusion<S: AsRef<str>>(
        &mut self,
        adapter_names: &[S],
        source: ConfigSource<AdapterFusionConfig>,
    ) -> AdapterResult<(String, Arc<AdapterFusionConfig>)> {
        let fusion_name = fusion_name_of(adapter_names);
        if self.fusions.contains_key(&fusion_name) {
            return Err(AdapterError::Conflict {
                name: fusion_name,
                reason: "an adapter fusion with these adapters has already been added".to_string(),
            });
        }
        let (key, config) = self.fusion_config_map.resolve(source)?;
        self.fusions.insert(fusion_name.clone(), key);
        Ok((fusion_name, config))
    }

    pub fn get_fusion(&self, fusion_name: &str) -> Option<Arc<AdapterFusionConfig>> {
        self.fusions
            .get(fusion_name)
            .and_then(|key| self.fusion_config_map.get(key))
    }

    pub fn fusion_names(&self) -> Vec<String> {
        self.fusions.keys().cloned().collect()
    }

    pub fn remove_fusion(&mut self, fusion_name: &str) -> Option<Arc<AdapterFusionConfig>> {
        let config = self.get_fusion(fusion_name);
        self.fusions.remove(fusion_name);
        config
    }

    pub fn active_setup(&self) -> Option<&AdapterCompositionBlock> {
        self.active_setup.as_ref()
    }

    pub fn set_active_setup(&mut self, setup: Option<AdapterCompositionBlock>) {
        self.active_setup = setup;
    }

    /// Adapter, fusion and config tables as one JSON document
    pub fn to_json(&self) -> AdapterResult<Value> {
        Ok(json!({
            "adapters": self.adapters,
            "config_map": self.config_map.to_json()?,
            "fusions": self.fusions,
            "fusion_config_map": self.fusion_config_map.to_json()?,
            "active_setup": self.active_setup.as_ref().map(|s| s.to_string()),
        }))
    }
}
