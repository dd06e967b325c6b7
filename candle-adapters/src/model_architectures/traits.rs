//! Injection capability traits and per-call forward context

use crate::composition::AdapterCompositionBlock;
use crate::config::{AdapterConfig, AdapterFusionConfig};
use crate::core::AdapterResult;
use candle_core::{DType, Device, Tensor, Var};
use std::cell::Cell;

/// Parameter group names, used as key segments in saved weights
pub mod groups {
    pub const LORAS: &str = "loras";
    pub const ADAPTERS: &str = "adapters";
    pub const PREFIX_TUNINGS: &str = "prefix_tunings";
    pub const INVERTIBLE_ADAPTERS: &str = "invertible_adapters";
    pub const FUSION: &str = "adapter_fusion_layer";
    pub const HEADS: &str = "heads";
}

/// State threaded through one forward call
///
/// Created per call from the explicit override or the model's active setup.
/// The only mutable part is the flag recording that a Parallel block has
/// already replicated the batch.
#[derive(Debug, Default)]
pub struct ForwardContext {
    pub adapter_setup: Option<AdapterCompositionBlock>,
    pub train: bool,
    pub skip_layers: Vec<usize>,
    parallelized: Cell<bool>,
}

impl ForwardContext {
    pub fn new(adapter_setup: Option<AdapterCompositionBlock>, train: bool) -> Self {
        Self {
            adapter_setup,
            train,
            skip_layers: Vec::new(),
            parallelized: Cell::new(false),
        }
    }

    pub fn with_skip_layers(mut self, skip_layers: Vec<usize>) -> Self {
        self.skip_layers = skip_layers;
        self
    }

    /// Active setup at `layer_idx`, or `None` when the layer is skipped
    pub fn setup_for_layer(&self, layer_idx: Option<usize>) -> Option<&AdapterCompositionBlock> {
        match layer_idx {
            Some(idx) if self.skip_layers.contains(&idx) => None,
            _ => self.adapter_setup.as_ref(),
        }
    }

    pub fn is_parallelized(&self) -> bool {
        self.parallelized.get()
    }

    pub fn mark_parallelized(&self) {
        self.parallelized.set(true);
    }
}

/// A location inside the host model that hosts adapter modules
pub trait InjectionPoint {
    /// Location kind, e.g. `selfattn`, `output_adapter`
    fn location_key(&self) -> &str;

    /// Layer index, `None` for model-level points
    fn layer_idx(&self) -> Option<usize>;

    /// Key segment grouping this point's adapter parameters
    fn parameter_group(&self) -> &'static str;

    /// Create the module for `name` when `config` applies here.
    /// Returns `Ok(false)` when it does not, which is not an error.
    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool>;

    /// Remove the module for `name`; merged weights are restored first
    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()>;

    fn has_adapter(&self, name: &str) -> bool;

    fn adapter_names(&self) -> Vec<String>;

    /// Trainable parameters of one adapter, keyed relative to `<group>.<name>.`
    fn adapter_parameters(&self, name: &str) -> Vec<(String, Var)>;

    /// Create a fusion layer over `adapter_names` when this point hosts them
    fn add_fusion_layer(
        &mut self,
        _adapter_names: &[String],
        _config: &AdapterFusionConfig,
    ) -> AdapterResult<bool> {
        Ok(false)
    }

    fn delete_fusion_layer(&mut self, _fusion_name: &str) -> AdapterResult<()> {
        Ok(())
    }

    fn fusion_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fusion parameters keyed relative to `adapter_fusion_layer.<fusion name>.`
    fn fusion_parameters(&self, _fusion_name: &str) -> Vec<(String, Var)> {
        Vec::new()
    }

    /// Sum of regularization losses of this point's fusion layers
    fn fusion_regularization_loss(&self) -> AdapterResult<Option<Tensor>> {
        Ok(None)
    }

    /// Fold `name` into the wrapped weight. Returns whether anything was merged here.
    fn merge_adapter(&mut self, _name: &str) -> AdapterResult<bool> {
        Ok(false)
    }

    /// Undo the current merge, if any
    fn reset_adapter(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    fn merged_adapter(&self) -> Option<&str> {
        None
    }
}

/// Capability implemented once per host architecture
///
/// Exposes every injection point by dotted path and runs the host forward
/// pass with a [`ForwardContext`].
pub trait AdapterInjection {
    fn model_type(&self) -> &str;

    fn hidden_size(&self) -> usize;

    fn num_layers(&self) -> usize;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    fn injection_points(&self) -> Vec<(String, &dyn InjectionPoint)>;

    fn injection_points_mut(&mut self) -> Vec<(String, &mut dyn InjectionPoint)>;

    /// Last hidden state `(batch, seq, hidden)`
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor>;

    /// Undo embedding-level invertible adapters before an LM head
    fn invert_hidden_states(&self, hidden_states: &Tensor, _ctx: &ForwardContext) -> AdapterResult<Tensor> {
        Ok(hidden_states.clone())
    }
}
