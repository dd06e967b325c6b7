//! Adapter model facade
//!
//! `AdapterModel<M>` wraps any host implementing [`AdapterInjection`] and
//! applies every adapter operation uniformly across the host's injection
//! points: add, delete, fuse, activate, train selection, merge, averaging
//! and bundle persistence. Prediction heads live next to the adapters in a
//! [`HeadDispatch`].

use crate::composition::{fusion_name_of, normalize_setup, AdapterCompositionBlock};
use crate::config::{config_hash, AdapterConfig, AdapterFusionConfig, ConfigSource};
use crate::core::config_loader::{
    extract_prefixed, rename_adapter_keys, BundleLoader, ADAPTER_CONFIG_NAME, ADAPTER_WEIGHTS_NAME, FUSION_CONFIG_NAME,
    FUSION_WEIGHTS_NAME, HEAD_CONFIG_NAME, HEAD_WEIGHTS_NAME,
};
use crate::core::{bundle_errors, lookup_errors, AdapterError, AdapterResult};
use crate::heads::{DispatchOutput, HeadConfig, HeadDispatch, HeadInputs, Label2Id};
use crate::model::adapters_config::ModelAdaptersConfig;
use crate::model_architectures::traits::{groups, AdapterInjection, ForwardContext};
use crate::{config_error, precondition_error};
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};

/// `adapter_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterBundleConfig {
    pub config: AdapterConfig,
    pub model_type: String,
    pub hidden_size: usize,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `adapter_fusion_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionBundleConfig {
    pub config: AdapterFusionConfig,
    pub model_type: String,
    pub hidden_size: usize,
    pub adapter_names: Vec<String>,
    pub name: String,
}

/// `head_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadBundleConfig {
    pub config: HeadConfig,
    pub name: String,
    pub model_type: String,
    pub hidden_size: usize,
    #[serde(default)]
    pub label2id: Option<Label2Id>,
}

/// Per-call overrides of [`AdapterModel::forward`]
///
/// An explicit `adapter_setup` replaces the model's active composition for
/// this call only.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    pub adapter_setup: Option<AdapterCompositionBlock>,
    pub head: Option<String>,
    pub skip_layers: Vec<usize>,
    pub train: bool,
    pub head_inputs: HeadInputs,
}

impl ForwardOptions {
    pub fn with_setup(mut self, setup: AdapterCompositionBlock) -> Self {
        self.adapter_setup = Some(setup);
        self
    }

    pub fn with_head(mut self, head: &str) -> Self {
        self.head = Some(head.to_string());
        self
    }

    pub fn with_skip_layers(mut self, skip_layers: Vec<usize>) -> Self {
        self.skip_layers = skip_layers;
        self
    }

    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn with_head_inputs(mut self, inputs: HeadInputs) -> Self {
        self.head_inputs = inputs;
        self
    }
}

/// Adapters and fusions whose parameters are handed to the optimizer
#[derive(Debug, Clone, Default)]
struct TrainableSelection {
    adapters: BTreeSet<String>,
    fusions: BTreeSet<String>,
}

/// Delegation wrapper adding adapter management to a host model
#[derive(Debug)]
pub struct AdapterModel<M: AdapterInjection> {
    model: M,
    adapters_config: ModelAdaptersConfig,
    heads: HeadDispatch,
    trainable: TrainableSelection,
}

impl<M: AdapterInjection> AdapterModel<M> {
    pub fn new(model: M) -> Self {
        let heads = HeadDispatch::new(model.hidden_size(), model.device(), model.dtype());
        Self {
            model,
            adapters_config: ModelAdaptersConfig::new(),
            heads,
            trainable: TrainableSelection::default(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn adapters_config(&self) -> &ModelAdaptersConfig {
        &self.adapters_config
    }

    pub fn heads(&self) -> &HeadDispatch {
        &self.heads
    }

    pub fn heads_mut(&mut self) -> &mut HeadDispatch {
        &mut self.heads
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters_config.contains(name)
    }

    fn ensure_registered(&self, name: &str) -> AdapterResult<()> {
        if self.adapters_config.contains(name) {
            Ok(())
        } else {
            Err(lookup_errors::unknown_adapter(name))
        }
    }

    // ------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------

    /// Add adapter `name` at every injection point its config applies to
    pub fn add_adapter<S>(&mut self, name: &str, source: S, overwrite_ok: bool) -> AdapterResult<()>
    where
        S: Into<ConfigSource<AdapterConfig>>,
    {
        if overwrite_ok && self.adapters_config.contains(name) {
            self.delete_adapter(name)?;
        }
        let config = self.adapters_config.add(name, source.into())?;

        let mut created = 0usize;
        let mut failure = None;
        for (path, point) in self.model.injection_points_mut() {
            match point.add_adapter(name, &config) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Adding adapter '{}' failed at {}", name, path);
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for (_, point) in self.model.injection_points_mut() {
                point.delete_adapter(name)?;
            }
            self.adapters_config.remove(name);
            return Err(err);
        }
        if created == 0 {
            warn!("Adapter '{}' ({}) was not added at any injection point", name, config.architecture());
        }
        info!("Adding adapter '{}' ({}) at {} injection points", name, config.architecture(), created);
        Ok(())
    }

    /// Remove an adapter everywhere; a merged adapter is unmerged first
    pub fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        self.ensure_registered(name)?;
        let dependent: Vec<String> = self
            .adapters_config
            .fusion_names()
            .into_iter()
            .filter(|fusion_name| fusion_name.split(',').any(|member| member == name))
            .collect();
        for fusion_name in dependent {
            warn!("Deleting adapter fusion '{}' which uses adapter '{}'", fusion_name, name);
            let members: Vec<&str> = fusion_name.split(',').collect();
            self.delete_adapter_fusion(&members)?;
        }
        for (_, point) in self.model.injection_points_mut() {
            point.delete_adapter(name)?;
        }
        self.adapters_config.remove(name);
        self.trainable.adapters.remove(name);
        if self
            .adapters_config
            .active_setup()
            .map_or(false, |setup| setup.contains(name))
        {
            self.adapters_config.set_active_setup(None);
        }
        info!("Deleted adapter '{}'", name);
        Ok(())
    }

    /// Register a fusion layer over `adapter_names` at every point hosting one of them
    pub fn add_adapter_fusion<S>(&mut self, adapter_names: &[&str], source: S) -> AdapterResult<String>
    where
        S: Into<ConfigSource<AdapterFusionConfig>>,
    {
        if adapter_names.len() < 2 {
            return Err(config_error!("add_adapter_fusion", "a fusion needs at least two adapters"));
        }
        for name in adapter_names {
            self.ensure_registered(name)?;
        }
        let (fusion_name, config) = self.adapters_config.add_fusion(adapter_names, source.into())?;
        let names: Vec<String> = adapter_names.iter().map(|n| n.to_string()).collect();

        let mut failure = None;
        for (_, point) in self.model.injection_points_mut() {
            if let Err(e) = point.add_fusion_layer(&names, &config) {
                failure = Some(e);
                break;
            }
        }
        if let Some(err) = failure {
            for (_, point) in self.model.injection_points_mut() {
                point.delete_fusion_layer(&fusion_name)?;
            }
            self.adapters_config.remove_fusion(&fusion_name);
            return Err(err);
        }
        info!("Adding adapter fusion '{}'", fusion_name);
        Ok(fusion_name)
    }

    pub fn delete_adapter_fusion(&mut self, adapter_names: &[&str]) -> AdapterResult<()> {
        let fusion_name = fusion_name_of(adapter_names);
        if self.adapters_config.remove_fusion(&fusion_name).is_none() {
            return Err(lookup_errors::unknown_adapter_in(&fusion_name, "adapter fusion"));
        }
        for (_, point) in self.model.injection_points_mut() {
            point.delete_fusion_layer(&fusion_name)?;
        }
        self.trainable.fusions.remove(&fusion_name);
        info!("Deleted adapter fusion '{}'", fusion_name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activation and training selection
    // ------------------------------------------------------------------

    /// Make `setup` the default composition of every forward pass
    ///
    /// Also activates the prediction head named after the setup's last leaf
    /// when such a head exists.
    pub fn set_active_adapters<B: Into<AdapterCompositionBlock>>(&mut self, setup: B) -> AdapterResult<()> {
        let setup = normalize_setup(setup.into())?;
        for name in setup.flatten() {
            self.ensure_registered(&name)?;
        }
        if let Some(head_name) = setup.last() {
            if self.heads.has_head(head_name) {
                self.heads.set_active_head(Some(head_name))?;
            } else {
                info!("No prediction head for task_name '{}' available.", head_name);
            }
        }
        self.adapters_config.set_active_setup(Some(setup));
        Ok(())
    }

    pub fn deactivate_adapters(&mut self) {
        self.adapters_config.set_active_setup(None);
    }

    pub fn active_adapters(&self) -> Option<&AdapterCompositionBlock> {
        self.adapters_config.active_setup()
    }

    /// Activate `setup` and select its adapters for training
    pub fn train_adapter<B: Into<AdapterCompositionBlock>>(&mut self, setup: B) -> AdapterResult<()> {
        let setup = normalize_setup(setup.into())?;
        self.set_active_adapters(setup.clone())?;
        self.trainable = TrainableSelection {
            adapters: setup.flatten().into_iter().collect(),
            fusions: BTreeSet::new(),
        };
        info!("Training adapters {}", setup);
        Ok(())
    }

    /// Activate `setup` and select its fusion layers for training, plus its
    /// adapters when `unfreeze_adapters` is set
    pub fn train_adapter_fusion<B: Into<AdapterCompositionBlock>>(
        &mut self,
        setup: B,
        unfreeze_adapters: bool,
    ) -> AdapterResult<()> {
        let setup = normalize_setup(setup.into())?;
        let mut fusions = BTreeSet::new();
        collect_fusion_names(&setup, &mut fusions);
        if fusions.is_empty() {
            return Err(config_error!(
                "train_adapter_fusion",
                format!("setup {} contains no Fuse block", setup)
            ));
        }
        for fusion_name in &fusions {
            if self.adapters_config.get_fusion(fusion_name).is_none() {
                return Err(lookup_errors::unknown_adapter_in(fusion_name, "adapter fusion"));
            }
        }
        self.set_active_adapters(setup.clone())?;
        let adapters = if unfreeze_adapters {
            setup.flatten().into_iter().collect()
        } else {
            BTreeSet::new()
        };
        self.trainable = TrainableSelection { adapters, fusions };
        info!("Training adapter fusion {}", setup);
        Ok(())
    }

    /// Parameters of the selected adapters and fusions plus every head
    ///
    /// Base weights are plain tensors and never appear here.
    pub fn trainable_parameters(&self) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        for name in &self.trainable.adapters {
            params.extend(self.adapter_state(name));
        }
        for fusion_name in &self.trainable.fusions {
            params.extend(self.fusion_state(fusion_name));
        }
        for head_name in self.heads.head_names() {
            params.extend(self.heads.head_parameters(&head_name));
        }
        params
    }

    /// Parameters of one adapter keyed `<point path>.<group>.<name>.<local>`
    pub fn adapter_state(&self, name: &str) -> Vec<(String, Var)> {
        let mut state = Vec::new();
        for (path, point) in self.model.injection_points() {
            if !point.has_adapter(name) {
                continue;
            }
            for (local, var) in point.adapter_parameters(name) {
                state.push((format!("{}.{}.{}.{}", path, point.parameter_group(), name, local), var));
            }
        }
        state
    }

    /// Parameters of one fusion keyed `<point path>.adapter_fusion_layer.<fusion name>.<local>`
    pub fn fusion_state(&self, fusion_name: &str) -> Vec<(String, Var)> {
        let mut state = Vec::new();
        for (path, point) in self.model.injection_points() {
            for (local, var) in point.fusion_parameters(fusion_name) {
                state.push((format!("{}.{}.{}.{}", path, groups::FUSION, fusion_name, local), var));
            }
        }
        state
    }

    // ------------------------------------------------------------------
    // Merging and averaging
    // ------------------------------------------------------------------

    /// Fold a LoRA adapter into the base weights of every point hosting it
    ///
    /// Either every point merges or none does.
    pub fn merge_adapter(&mut self, name: &str) -> AdapterResult<()> {
        let config = self
            .adapters_config
            .get(name)
            .ok_or_else(|| lookup_errors::unknown_adapter(name))?;
        if !config.is_mergeable() {
            return Err(config_error!(
                "merge_adapter",
                format!("adapter '{}' of type {} cannot be merged", name, config.architecture())
            ));
        }

        let mut merged_here = Vec::new();
        let mut failure = None;
        for (path, point) in self.model.injection_points_mut() {
            let was_merged = point.merged_adapter().is_some();
            match point.merge_adapter(name) {
                Ok(true) if !was_merged => merged_here.push(path),
                Ok(_) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for (path, point) in self.model.injection_points_mut() {
                if merged_here.contains(&path) {
                    point.reset_adapter()?;
                }
            }
            return Err(err);
        }
        info!("Merged adapter '{}' at {} injection points", name, merged_here.len());
        Ok(())
    }

    /// Undo every merge
    pub fn reset_adapter(&mut self) -> AdapterResult<()> {
        for (_, point) in self.model.injection_points_mut() {
            point.reset_adapter()?;
        }
        info!("Reset merged adapters");
        Ok(())
    }

    /// Reset every point where `name` is merged; returns whether any was
    fn unmerge_points_of(&mut self, name: &str) -> AdapterResult<bool> {
        let mut unmerged = false;
        for (_, point) in self.model.injection_points_mut() {
            if point.merged_adapter() == Some(name) {
                point.reset_adapter()?;
                unmerged = true;
            }
        }
        Ok(unmerged)
    }

    /// Add `name` whose parameters are the weighted sum of the sources'
    ///
    /// Weights default to uniform. With `normalize` they are divided by their sum.
    pub fn average_adapter(
        &mut self,
        name: &str,
        sources: &[&str],
        weights: Option<&[f64]>,
        normalize: bool,
    ) -> AdapterResult<()> {
        let first = sources
            .first()
            .ok_or_else(|| config_error!("average_adapter", "no source adapters given"))?;
        let config = self
            .adapters_config
            .get(first)
            .ok_or_else(|| lookup_errors::unknown_adapter(first))?;
        for source in sources {
            let other = self
                .adapters_config
                .get(source)
                .ok_or_else(|| lookup_errors::unknown_adapter(source))?;
            if *other != *config {
                return Err(config_error!(
                    "average_adapter",
                    format!("adapter '{}' has a different config than '{}'", source, first)
                ));
            }
        }
        let mut weights: Vec<f64> = match weights {
            Some(w) if w.len() != sources.len() => {
                return Err(config_error!(
                    "average_adapter",
                    format!("{} weights for {} adapters", w.len(), sources.len())
                ))
            }
            Some(w) => w.to_vec(),
            None => vec![1.0 / sources.len() as f64; sources.len()],
        };
        if normalize {
            let total: f64 = weights.iter().sum();
            if total == 0.0 {
                return Err(config_error!("average_adapter", "weights sum to zero"));
            }
            weights.iter_mut().for_each(|w| *w /= total);
        }

        let source_states: Vec<HashMap<String, Tensor>> = sources
            .iter()
            .map(|source| rename_adapter_keys(to_tensor_map(self.adapter_state(source)), source, name))
            .collect();

        self.add_adapter(name, (*config).clone(), false)?;
        for (key, target) in self.adapter_state(name) {
            let mut sum: Option<Tensor> = None;
            for (state, weight) in source_states.iter().zip(&weights) {
                let tensor = state
                    .get(&key)
                    .ok_or_else(|| precondition_error!("average_adapter", format!("missing parameter {}", key)))?;
                let scaled = tensor.affine(*weight, 0.0)?;
                sum = Some(match sum {
                    Some(acc) => acc.add(&scaled)?,
                    None => scaled,
                });
            }
            if let Some(sum) = sum {
                target.set(&sum.detach())?;
            }
        }
        info!("Averaged {:?} into adapter '{}'", sources, name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forward
    // ------------------------------------------------------------------

    fn forward_context(&self, options: &ForwardOptions) -> AdapterResult<ForwardContext> {
        let setup = match &options.adapter_setup {
            Some(setup) => Some(normalize_setup(setup.clone())?),
            None => self.adapters_config.active_setup().cloned(),
        };
        Ok(ForwardContext::new(setup, options.train).with_skip_layers(options.skip_layers.clone()))
    }

    /// Last hidden state of the host under the resolved composition
    pub fn forward_hidden(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        options: &ForwardOptions,
    ) -> AdapterResult<Tensor> {
        let ctx = self.forward_context(options)?;
        self.model.forward(input_ids, attention_mask, &ctx)
    }

    /// Host forward pass followed by head dispatch
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        options: &ForwardOptions,
    ) -> AdapterResult<DispatchOutput> {
        let ctx = self.forward_context(options)?;
        let mut hidden_states = self.model.forward(input_ids, attention_mask, &ctx)?;

        let head_name = options.head.as_deref().or(self.heads.active_head());
        if let Some(head) = head_name.and_then(|n| self.heads.head(n)) {
            if head.config().is_language_modeling() {
                hidden_states = self.model.invert_hidden_states(&hidden_states, &ctx)?;
            }
        }
        let mut inputs = options.head_inputs.clone();
        if inputs.attention_mask.is_none() {
            inputs.attention_mask = attention_mask.cloned();
        }
        self.heads
            .forward_head(&hidden_states, options.head.as_deref(), &inputs, options.train)
    }

    /// Sum of the regularization losses of every fusion layer
    pub fn fusion_regularization_loss(&self) -> AdapterResult<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for (_, point) in self.model.injection_points() {
            if let Some(loss) = point.fusion_regularization_loss()? {
                total = Some(match total {
                    Some(acc) => acc.add(&loss)?,
                    None => loss,
                });
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Heads
    // ------------------------------------------------------------------

    pub fn add_prediction_head(&mut self, name: &str, config: HeadConfig, overwrite_ok: bool) -> AdapterResult<()> {
        self.heads.add_prediction_head(name, config, overwrite_ok)
    }

    pub fn delete_head(&mut self, name: &str) -> AdapterResult<()> {
        self.heads.delete_head(name)
    }

    pub fn set_active_head(&mut self, name: Option<&str>) -> AdapterResult<()> {
        self.heads.set_active_head(name)
    }

    pub fn active_head(&self) -> Option<&str> {
        self.heads.active_head()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn check_bundle_host(&self, kind: &str, model_type: &str, hidden_size: usize) -> AdapterResult<()> {
        if model_type != self.model.model_type() {
            warn!(
                "Loading {} saved for model type '{}' into '{}'",
                kind,
                model_type,
                self.model.model_type()
            );
        }
        if hidden_size != self.model.hidden_size() {
            return Err(config_error!(
                format!("load {}", kind),
                format!(
                    "bundle hidden size {} does not match model hidden size {}",
                    hidden_size,
                    self.model.hidden_size()
                )
            ));
        }
        Ok(())
    }

    /// Save adapter `name` and, when present, the head of the same name
    pub fn save_adapter(&self, dir: &Path, name: &str, with_head: bool) -> AdapterResult<()> {
        let config = self
            .adapters_config
            .get(name)
            .ok_or_else(|| lookup_errors::unknown_adapter(name))?;
        let bundle = AdapterBundleConfig {
            config: (*config).clone(),
            model_type: self.model.model_type().to_string(),
            hidden_size: self.model.hidden_size(),
            name: name.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        BundleLoader::save_json_config(dir, ADAPTER_CONFIG_NAME, &bundle)?;
        BundleLoader::save_weights(dir, ADAPTER_WEIGHTS_NAME, &to_tensor_map(self.adapter_state(name)))?;
        if with_head && self.heads.has_head(name) {
            self.save_head(dir, name)?;
        }
        info!("Saved adapter '{}' to {}", name, dir.display());
        Ok(())
    }

    /// Load an adapter bundle, optionally under a new name; returns the name used
    ///
    /// Loading onto an existing adapter with a different config is a conflict.
    pub fn load_adapter(&mut self, dir: &Path, load_as: Option<&str>) -> AdapterResult<String> {
        let bundle: AdapterBundleConfig = BundleLoader::load_json_config(dir, ADAPTER_CONFIG_NAME)?;
        self.check_bundle_host("adapter", &bundle.model_type, bundle.hidden_size)?;
        let name = load_as.unwrap_or(bundle.name.as_str()).to_string();

        match self.adapters_config.get(&name) {
            Some(existing) => {
                if config_hash(existing.as_ref())? != config_hash(&bundle.config)? {
                    return Err(AdapterError::Conflict {
                        name: name.clone(),
                        reason: "an adapter with this name but a different config is already loaded".to_string(),
                    });
                }
            }
            None => self.add_adapter(&name, bundle.config.clone(), false)?,
        }

        let weights = BundleLoader::load_weights(dir, ADAPTER_WEIGHTS_NAME, self.model.device())?;
        let weights = rename_adapter_keys(weights, &bundle.name, &name);
        let file = dir.join(ADAPTER_WEIGHTS_NAME).display().to_string();

        // Merged weights hold the old delta; unmerge before the parameters change
        let was_merged = self.unmerge_points_of(&name)?;
        assign_state(self.adapter_state(&name), &weights, &file)?;
        if was_merged {
            self.merge_adapter(&name)?;
        }

        if BundleLoader::has_bundle(dir, HEAD_CONFIG_NAME) {
            self.load_head(dir, Some(&name))?;
        }
        info!("Loaded adapter '{}' from {}", name, dir.display());
        Ok(name)
    }

    pub fn save_adapter_fusion(&self, dir: &Path, adapter_names: &[&str]) -> AdapterResult<()> {
        let fusion_name = fusion_name_of(adapter_names);
        let config = self
            .adapters_config
            .get_fusion(&fusion_name)
            .ok_or_else(|| lookup_errors::unknown_adapter_in(&fusion_name, "adapter fusion"))?;
        let mut sorted: Vec<String> = adapter_names.iter().map(|n| n.to_string()).collect();
        sorted.sort();
        let bundle = FusionBundleConfig {
            config: (*config).clone(),
            model_type: self.model.model_type().to_string(),
            hidden_size: self.model.hidden_size(),
            adapter_names: sorted,
            name: fusion_name.clone(),
        };
        BundleLoader::save_json_config(dir, FUSION_CONFIG_NAME, &bundle)?;
        BundleLoader::save_weights(dir, FUSION_WEIGHTS_NAME, &to_tensor_map(self.fusion_state(&fusion_name)))?;
        info!("Saved adapter fusion '{}' to {}", fusion_name, dir.display());
        Ok(())
    }

    /// Load a fusion bundle; the fused adapters must already be loaded
    pub fn load_adapter_fusion(&mut self, dir: &Path) -> AdapterResult<String> {
        let bundle: FusionBundleConfig = BundleLoader::load_json_config(dir, FUSION_CONFIG_NAME)?;
        self.check_bundle_host("adapter fusion", &bundle.model_type, bundle.hidden_size)?;
        let names: Vec<&str> = bundle.adapter_names.iter().map(String::as_str).collect();
        let fusion_name = fusion_name_of(&names);
        if self.adapters_config.get_fusion(&fusion_name).is_none() {
            self.add_adapter_fusion(&names, bundle.config.clone())?;
        }
        let weights = BundleLoader::load_weights(dir, FUSION_WEIGHTS_NAME, self.model.device())?;
        let file = dir.join(FUSION_WEIGHTS_NAME).display().to_string();
        assign_state(self.fusion_state(&fusion_name), &weights, &file)?;
        info!("Loaded adapter fusion '{}' from {}", fusion_name, dir.display());
        Ok(fusion_name)
    }

    pub fn save_head(&self, dir: &Path, name: &str) -> AdapterResult<()> {
        let head = self.heads.head(name).ok_or_else(|| lookup_errors::unknown_head(name))?;
        let bundle = HeadBundleConfig {
            config: head.config().clone(),
            name: name.to_string(),
            model_type: self.model.model_type().to_string(),
            hidden_size: self.model.hidden_size(),
            label2id: head.config().label2id().cloned(),
        };
        BundleLoader::save_json_config(dir, HEAD_CONFIG_NAME, &bundle)?;
        BundleLoader::save_weights(dir, HEAD_WEIGHTS_NAME, &to_tensor_map(self.heads.head_parameters(name)))?;
        Ok(())
    }

    /// Load a head bundle, replacing any head of the same name
    pub fn load_head(&mut self, dir: &Path, load_as: Option<&str>) -> AdapterResult<String> {
        let bundle: HeadBundleConfig = BundleLoader::load_json_config(dir, HEAD_CONFIG_NAME)?;
        self.check_bundle_host("head", &bundle.model_type, bundle.hidden_size)?;
        let name = load_as.unwrap_or(bundle.name.as_str()).to_string();
        let config = match bundle.label2id {
            Some(labels) => bundle.config.with_label2id(labels),
            None => bundle.config,
        };
        self.heads.add_prediction_head(&name, config, true)?;

        let weights = BundleLoader::load_weights(dir, HEAD_WEIGHTS_NAME, self.model.device())?;
        // Stored keys carry the bundle's head name; the head itself uses local names
        let weights = extract_prefixed(&weights, &format!("{}.{}.", groups::HEADS, bundle.name));
        let targets = self.heads.head(&name).map(|head| head.named_vars()).unwrap_or_default();
        let file = dir.join(HEAD_WEIGHTS_NAME).display().to_string();
        assign_state(targets, &weights, &file)?;
        info!("Loaded head '{}' from {}", name, dir.display());
        Ok(name)
    }
}

/// Every fusion layer name referenced by a Fuse block inside `block`
fn collect_fusion_names(block: &AdapterCompositionBlock, names: &mut BTreeSet<String>) {
    if let Some(fusion_name) = block.fusion_name() {
        names.insert(fusion_name);
    }
    if !matches!(block, AdapterCompositionBlock::Adapter(_)) {
        for child in block.children() {
            collect_fusion_names(child, names);
        }
    }
}

fn to_tensor_map(state: Vec<(String, Var)>) -> HashMap<String, Tensor> {
    state
        .into_iter()
        .map(|(key, var)| (key, var.as_tensor().detach()))
        .collect()
}

/// Copy loaded tensors into the target `Var`s
fn assign_state(targets: Vec<(String, Var)>, weights: &HashMap<String, Tensor>, file: &str) -> AdapterResult<()> {
    let expected: BTreeSet<&String> = targets.iter().map(|(k, _)| k).collect();
    for key in weights.keys().filter(|k| !expected.contains(k)) {
        warn!("Ignoring unexpected tensor '{}' in {}", key, file);
    }
    for (key, var) in &targets {
        let tensor = weights
            .get(key)
            .ok_or_else(|| bundle_errors::missing_tensor(key, file))?;
        if tensor.dims() != var.dims() {
            return Err(config_error!(
                "bundle weight loading",
                format!("tensor '{}' has shape {:?}, expected {:?}", key, tensor.dims(), var.dims()),
                format!("file: {}", file)
            ));
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    Ok(())
}
