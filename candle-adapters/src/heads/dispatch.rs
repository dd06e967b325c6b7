//! Head table and active-head resolution

use crate::config_error;
use crate::core::{lookup_errors, AdapterError, AdapterResult};
use crate::heads::prediction_head::{
    CustomHeadBuilder, HeadBuildContext, HeadConfig, HeadInputs, HeadOutput, PredictionHead,
};
use crate::model_architectures::traits::groups;
use crate::precondition_error;
use candle_core::{DType, Device, Tensor, Var};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Result of [`HeadDispatch::forward_head`]
#[derive(Debug, Clone)]
pub enum DispatchOutput {
    /// No head resolved; the hidden states are returned unchanged
    HiddenStates(Tensor),
    Head { name: String, output: HeadOutput },
}

impl DispatchOutput {
    pub fn head_output(&self) -> Option<&HeadOutput> {
        match self {
            DispatchOutput::Head { output, .. } => Some(output),
            DispatchOutput::HiddenStates(_) => None,
        }
    }

    pub fn hidden_states(&self) -> Option<&Tensor> {
        match self {
            DispatchOutput::HiddenStates(hidden) => Some(hidden),
            DispatchOutput::Head { .. } => None,
        }
    }
}

/// Prediction heads of one model plus the active head
pub struct HeadDispatch {
    build_context: HeadBuildContext,
    heads: BTreeMap<String, PredictionHead>,
    active_head: Option<String>,
    custom_builders: HashMap<String, CustomHeadBuilder>,
}

impl std::fmt::Debug for HeadDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadDispatch")
            .field("heads", &self.heads.keys().collect::<Vec<_>>())
            .field("active_head", &self.active_head)
            .field("custom_heads", &self.custom_builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HeadDispatch {
    pub fn new(hidden_size: usize, device: &Device, dtype: DType) -> Self {
        Self {
            build_context: HeadBuildContext {
                hidden_size,
                dropout: 0.1,
                device: device.clone(),
                dtype,
            },
            heads: BTreeMap::new(),
            active_head: None,
            custom_builders: HashMap::new(),
        }
    }

    /// Dropout applied before every dense layer of newly built heads
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.build_context.dropout = dropout;
        self
    }

    /// Make `identifier` usable as `HeadConfig::Custom { identifier, .. }`
    pub fn register_custom_head(&mut self, identifier: &str, builder: CustomHeadBuilder) {
        self.custom_builders.insert(identifier.to_string(), builder);
    }

    /// Build and register a head, then make it active
    pub fn add_prediction_head(&mut self, name: &str, config: HeadConfig, overwrite_ok: bool) -> AdapterResult<()> {
        if self.heads.contains_key(name) && !overwrite_ok {
            return Err(AdapterError::DuplicateHead { name: name.to_string() });
        }
        let config = config.with_default_labels();
        let head = match &config {
            HeadConfig::Custom { identifier, params } => {
                let builder = self.custom_builders.get(identifier).ok_or_else(|| {
                    config_error!(
                        "add_prediction_head",
                        format!("head type '{}' is not registered as a custom head", identifier)
                    )
                })?;
                let custom = builder(name, params, &self.build_context)?;
                PredictionHead::from_custom(name, config.clone(), custom)
            }
            _ => PredictionHead::new(name, config.clone(), &self.build_context)?,
        };
        info!("Adding head '{}' of type {}", name, config.head_type());
        self.heads.insert(name.to_string(), head);
        self.active_head = Some(name.to_string());
        Ok(())
    }

    pub fn delete_head(&mut self, name: &str) -> AdapterResult<()> {
        if self.heads.remove(name).is_none() {
            return Err(lookup_errors::unknown_head(name));
        }
        if self.active_head.as_deref() == Some(name) {
            self.active_head = None;
        }
        info!("Deleted head '{}'", name);
        Ok(())
    }

    pub fn set_active_head(&mut self, name: Option<&str>) -> AdapterResult<()> {
        match name {
            Some(n) if !self.heads.contains_key(n) => Err(lookup_errors::unknown_head(n)),
            _ => {
                self.active_head = name.map(str::to_string);
                Ok(())
            }
        }
    }

    pub fn active_head(&self) -> Option<&str> {
        self.active_head.as_deref()
    }

    pub fn has_head(&self, name: &str) -> bool {
        self.heads.contains_key(name)
    }

    pub fn head(&self, name: &str) -> Option<&PredictionHead> {
        self.heads.get(name)
    }

    pub fn head_names(&self) -> Vec<String> {
        self.heads.keys().cloned().collect()
    }

    pub fn hidden_size(&self) -> usize {
        self.build_context.hidden_size
    }

    /// Config of every head, as stored in bundles
    pub fn prediction_heads_config(&self) -> BTreeMap<String, HeadConfig> {
        self.heads
            .iter()
            .map(|(name, head)| (name.clone(), head.config().clone()))
            .collect()
    }

    /// Parameters of a head keyed `heads.<name>.<local>`
    pub fn head_parameters(&self, name: &str) -> Vec<(String, Var)> {
        match self.heads.get(name) {
            Some(head) => head
                .named_vars()
                .into_iter()
                .map(|(local, var)| (format!("{}.{}.{}", groups::HEADS, name, local), var))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Replace the label map of an existing head
    pub fn set_label2id(&mut self, name: &str, label2id: BTreeMap<String, usize>) -> AdapterResult<()> {
        let head = self
            .heads
            .get_mut(name)
            .ok_or_else(|| lookup_errors::unknown_head(name))?;
        let config = head.config().with_label2id(label2id);
        head.set_config(config);
        Ok(())
    }

    fn resolve<'a>(&'a self, head_name: Option<&'a str>) -> AdapterResult<&'a str> {
        head_name
            .or(self.active_head.as_deref())
            .ok_or_else(|| precondition_error!("labels", "no head name given and no active head in the model"))
    }

    /// id → label map of a head, or of the active head when `head_name` is `None`
    pub fn labels_dict(&self, head_name: Option<&str>) -> AdapterResult<Option<BTreeMap<usize, String>>> {
        let name = self.resolve(head_name)?;
        let head = self.heads.get(name).ok_or_else(|| lookup_errors::unknown_head(name))?;
        Ok(head
            .config()
            .label2id()
            .map(|map| map.iter().map(|(label, id)| (*id, label.clone())).collect()))
    }

    /// Labels ordered by id
    pub fn labels(&self, head_name: Option<&str>) -> AdapterResult<Option<Vec<String>>> {
        Ok(self
            .labels_dict(head_name)?
            .map(|dict| dict.into_values().collect()))
    }

    /// Run the named head, or the active head when `head_name` is `None`
    pub fn forward_head(
        &self,
        hidden_states: &Tensor,
        head_name: Option<&str>,
        inputs: &HeadInputs,
        train: bool,
    ) -> AdapterResult<DispatchOutput> {
        let name = match head_name.or(self.active_head.as_deref()) {
            Some(name) => name,
            None => {
                debug!("No prediction head is used.");
                return Ok(DispatchOutput::HiddenStates(hidden_states.clone()));
            }
        };
        let head = self.heads.get(name).ok_or_else(|| lookup_errors::unknown_head(name))?;
        let output = head.forward(hidden_states, inputs, train)?;
        Ok(DispatchOutput::Head {
            name: name.to_string(),
            output,
        })
    }
}
