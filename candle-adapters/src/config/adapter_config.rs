//! Adapter method configurations
//!
//! Configs are immutable values: build them once (presets, builders or JSON),
//! share them as `Arc<AdapterConfig>`, and derive variants with the `with_*`
//! methods, which return a new value.

use crate::config_error;
use crate::core::AdapterResult;
use crate::model_architectures::activation::ActivationFunction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Bottleneck reduction factor: one value for every layer or a per-layer map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReductionFactor {
    Uniform(f64),
    /// Layer index (as string) to factor, with an optional `"default"` entry
    PerLayer(BTreeMap<String, f64>),
}

impl ReductionFactor {
    /// Factor for `layer_idx`: exact layer entry, then `"default"`
    pub fn for_layer(&self, layer_idx: usize) -> AdapterResult<f64> {
        match self {
            ReductionFactor::Uniform(factor) => Ok(*factor),
            ReductionFactor::PerLayer(map) => map
                .get(&layer_idx.to_string())
                .or_else(|| map.get("default"))
                .copied()
                .ok_or_else(|| {
                    config_error!(
                        "reduction factor lookup",
                        format!("no reduction factor for layer {} and no 'default' entry", layer_idx)
                    )
                }),
        }
    }

    fn validate(&self) -> AdapterResult<()> {
        let positive = match self {
            ReductionFactor::Uniform(f) => *f > 0.0,
            ReductionFactor::PerLayer(map) => !map.is_empty() && map.values().all(|f| *f > 0.0),
        };
        if positive {
            Ok(())
        } else {
            Err(config_error!("BottleneckConfig", "reduction_factor must be positive"))
        }
    }
}

/// Coupling block type of an invertible embedding adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvertibleAdapterKind {
    Nice,
    Glow,
}

/// Weight initialization scheme of bottleneck adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckInit {
    /// Normal(0, 0.02) weights, zero biases
    Bert,
    /// Kaiming down projection, zero up projection
    MamAdapter,
}

/// LoRA composition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionMode {
    /// `W + s·BA`
    Add,
    /// `W ⊙ (s·BA)`
    Scale,
}

/// LoRA initialization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoRAInit {
    /// Kaiming-uniform A, zero B
    Lora,
    /// Normal(0, 0.02) for both matrices
    Bert,
    /// Ones, for scale-mode vectors
    Ia3,
}

/// Bottleneck adapter configuration (Pfeiffer, Houlsby, Compacter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    pub original_ln_before: bool,
    pub original_ln_after: bool,
    pub residual_before_ln: bool,
    pub adapter_residual_before_ln: bool,
    pub ln_before: bool,
    pub ln_after: bool,
    /// Adapter after the attention block
    pub mh_adapter: bool,
    /// Adapter after the feed-forward block
    pub output_adapter: bool,
    pub non_linearity: ActivationFunction,
    pub reduction_factor: ReductionFactor,
    pub inv_adapter: Option<InvertibleAdapterKind>,
    pub inv_adapter_reduction_factor: Option<f64>,
    pub leave_out: Vec<usize>,
    pub init_weights: BottleneckInit,
    pub phm_layer: bool,
    pub phm_dim: usize,
    pub phm_rank: usize,
    #[serde(rename = "factorized_phm_W")]
    pub factorized_phm_w: bool,
    pub factorized_phm_rule: bool,
    pub learn_phm: bool,
    pub phm_c_init: String,
    pub phm_init_range: f64,
    pub hypercomplex_nonlinearity: String,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self::pfeiffer()
    }
}

impl BottleneckConfig {
    /// Adapter after the feed-forward block only
    pub fn pfeiffer() -> Self {
        Self {
            original_ln_before: true,
            original_ln_after: true,
            residual_before_ln: true,
            adapter_residual_before_ln: false,
            ln_before: false,
            ln_after: false,
            mh_adapter: false,
            output_adapter: true,
            non_linearity: ActivationFunction::Relu,
            reduction_factor: ReductionFactor::Uniform(16.0),
            inv_adapter: None,
            inv_adapter_reduction_factor: None,
            leave_out: Vec::new(),
            init_weights: BottleneckInit::Bert,
            phm_layer: false,
            phm_dim: 4,
            phm_rank: 1,
            factorized_phm_w: true,
            factorized_phm_rule: false,
            learn_phm: true,
            phm_c_init: "normal".to_string(),
            phm_init_range: 0.0001,
            hypercomplex_nonlinearity: "glorot-uniform".to_string(),
        }
    }

    /// Adapters after both the attention and the feed-forward block
    pub fn houlsby() -> Self {
        Self {
            original_ln_before: false,
            mh_adapter: true,
            non_linearity: ActivationFunction::Swish,
            ..Self::pfeiffer()
        }
    }

    pub fn pfeiffer_inv() -> Self {
        Self {
            inv_adapter: Some(InvertibleAdapterKind::Nice),
            inv_adapter_reduction_factor: Some(2.0),
            ..Self::pfeiffer()
        }
    }

    pub fn houlsby_inv() -> Self {
        Self {
            inv_adapter: Some(InvertibleAdapterKind::Nice),
            inv_adapter_reduction_factor: Some(2.0),
            ..Self::houlsby()
        }
    }

    /// Houlsby placement with PHM projections
    pub fn compacter() -> Self {
        Self {
            phm_layer: true,
            reduction_factor: ReductionFactor::Uniform(32.0),
            non_linearity: ActivationFunction::Gelu,
            ..Self::houlsby()
        }
    }

    /// Pfeiffer placement with PHM projections
    pub fn compacter_plus_plus() -> Self {
        Self {
            phm_layer: true,
            reduction_factor: ReductionFactor::Uniform(32.0),
            non_linearity: ActivationFunction::Gelu,
            ..Self::pfeiffer()
        }
    }

    pub fn builder() -> BottleneckConfigBuilder {
        BottleneckConfigBuilder {
            config: Self::pfeiffer(),
        }
    }

    pub fn validate(&self) -> AdapterResult<()> {
        self.reduction_factor.validate()?;
        if self.phm_layer && (self.phm_dim == 0 || self.phm_rank == 0) {
            return Err(config_error!(
                "BottleneckConfig",
                "phm_dim and phm_rank must be positive when phm_layer is set"
            ));
        }
        if let Some(factor) = self.inv_adapter_reduction_factor {
            if factor <= 0.0 {
                return Err(config_error!(
                    "BottleneckConfig",
                    "inv_adapter_reduction_factor must be positive"
                ));
            }
        }
        Ok(())
    }

    pub fn with_reduction_factor(&self, reduction_factor: ReductionFactor) -> Self {
        Self {
            reduction_factor,
            ..self.clone()
        }
    }

    pub fn with_non_linearity(&self, non_linearity: ActivationFunction) -> Self {
        Self {
            non_linearity,
            ..self.clone()
        }
    }

    pub fn with_leave_out(&self, leave_out: Vec<usize>) -> Self {
        Self {
            leave_out,
            ..self.clone()
        }
    }
}

/// Validating builder for [`BottleneckConfig`]
#[derive(Debug, Clone)]
pub struct BottleneckConfigBuilder {
    config: BottleneckConfig,
}

impl BottleneckConfigBuilder {
    pub fn from_preset(config: BottleneckConfig) -> Self {
        Self { config }
    }

    pub fn reduction_factor(mut self, factor: f64) -> Self {
        self.config.reduction_factor = ReductionFactor::Uniform(factor);
        self
    }

    pub fn per_layer_reduction_factor(mut self, factors: BTreeMap<String, f64>) -> Self {
        self.config.reduction_factor = ReductionFactor::PerLayer(factors);
        self
    }

    pub fn non_linearity(mut self, activation: ActivationFunction) -> Self {
        self.config.non_linearity = activation;
        self
    }

    pub fn mh_adapter(mut self, enabled: bool) -> Self {
        self.config.mh_adapter = enabled;
        self
    }

    pub fn output_adapter(mut self, enabled: bool) -> Self {
        self.config.output_adapter = enabled;
        self
    }

    pub fn ln_before(mut self, enabled: bool) -> Self {
        self.config.ln_before = enabled;
        self
    }

    pub fn ln_after(mut self, enabled: bool) -> Self {
        self.config.ln_after = enabled;
        self
    }

    pub fn residual_before_ln(mut self, enabled: bool) -> Self {
        self.config.residual_before_ln = enabled;
        self
    }

    pub fn inv_adapter(mut self, kind: InvertibleAdapterKind, reduction_factor: f64) -> Self {
        self.config.inv_adapter = Some(kind);
        self.config.inv_adapter_reduction_factor = Some(reduction_factor);
        self
    }

    pub fn leave_out(mut self, layers: Vec<usize>) -> Self {
        self.config.leave_out = layers;
        self
    }

    pub fn init_weights(mut self, init: BottleneckInit) -> Self {
        self.config.init_weights = init;
        self
    }

    pub fn phm(mut self, phm_dim: usize, phm_rank: usize) -> Self {
        self.config.phm_layer = true;
        self.config.phm_dim = phm_dim;
        self.config.phm_rank = phm_rank;
        self
    }

    pub fn build(self) -> AdapterResult<BottleneckConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// LoRA / IA³ configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoRAConfig {
    pub selfattn_lora: bool,
    pub intermediate_lora: bool,
    pub output_lora: bool,
    pub leave_out: Vec<usize>,
    pub r: usize,
    pub alpha: f64,
    pub dropout: f64,
    /// Subset of `q`, `k`, `v`
    pub attn_matrices: Vec<String>,
    pub composition_mode: CompositionMode,
    pub init_weights: LoRAInit,
    /// A single per-output vector instead of a low-rank pair, `r` must be 1
    pub no_decomposition: bool,
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            selfattn_lora: true,
            intermediate_lora: false,
            output_lora: false,
            leave_out: Vec::new(),
            r: 8,
            alpha: 8.0,
            dropout: 0.0,
            attn_matrices: vec!["q".to_string(), "v".to_string()],
            composition_mode: CompositionMode::Add,
            init_weights: LoRAInit::Lora,
            no_decomposition: false,
        }
    }
}

impl LoRAConfig {
    /// (IA)³: learned scaling vectors on keys, values and the intermediate layer
    pub fn ia3() -> Self {
        Self {
            selfattn_lora: true,
            intermediate_lora: true,
            output_lora: false,
            r: 1,
            alpha: 1.0,
            dropout: 0.0,
            attn_matrices: vec!["k".to_string(), "v".to_string()],
            composition_mode: CompositionMode::Scale,
            init_weights: LoRAInit::Ia3,
            no_decomposition: true,
            ..Self::default()
        }
    }

    pub fn builder() -> LoRAConfigBuilder {
        LoRAConfigBuilder {
            config: Self::default(),
        }
    }

    /// `alpha / r`
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn validate(&self) -> AdapterResult<()> {
        if self.r == 0 {
            return Err(config_error!("LoRAConfig", "r must be greater than 0"));
        }
        if self.no_decomposition && self.r != 1 {
            return Err(config_error!(
                "LoRAConfig",
                "no_decomposition can only be used when r == 1"
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(config_error!("LoRAConfig", "dropout must be in [0, 1)"));
        }
        if let Some(bad) = self
            .attn_matrices
            .iter()
            .find(|m| !matches!(m.as_str(), "q" | "k" | "v"))
        {
            return Err(config_error!(
                "LoRAConfig",
                format!("unknown attention matrix '{}', expected q, k or v", bad)
            ));
        }
        Ok(())
    }

    pub fn targets_matrix(&self, attn_key: &str) -> bool {
        self.attn_matrices.iter().any(|m| m == attn_key)
    }

    pub fn with_r(&self, r: usize) -> Self {
        Self { r, ..self.clone() }
    }

    pub fn with_alpha(&self, alpha: f64) -> Self {
        Self {
            alpha,
            ..self.clone()
        }
    }

    pub fn with_composition_mode(&self, composition_mode: CompositionMode) -> Self {
        Self {
            composition_mode,
            ..self.clone()
        }
    }

    pub fn with_init_weights(&self, init_weights: LoRAInit) -> Self {
        Self {
            init_weights,
            ..self.clone()
        }
    }
}

/// Validating builder for [`LoRAConfig`]
#[derive(Debug, Clone)]
pub struct LoRAConfigBuilder {
    config: LoRAConfig,
}

impl LoRAConfigBuilder {
    pub fn r(mut self, r: usize) -> Self {
        self.config.r = r;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.config.alpha = alpha;
        self
    }

    pub fn dropout(mut self, dropout: f64) -> Self {
        self.config.dropout = dropout;
        self
    }

    pub fn attn_matrices(mut self, matrices: &[&str]) -> Self {
        self.config.attn_matrices = matrices.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn selfattn_lora(mut self, enabled: bool) -> Self {
        self.config.selfattn_lora = enabled;
        self
    }

    pub fn intermediate_lora(mut self, enabled: bool) -> Self {
        self.config.intermediate_lora = enabled;
        self
    }

    pub fn output_lora(mut self, enabled: bool) -> Self {
        self.config.output_lora = enabled;
        self
    }

    pub fn composition_mode(mut self, mode: CompositionMode) -> Self {
        self.config.composition_mode = mode;
        self
    }

    pub fn init_weights(mut self, init: LoRAInit) -> Self {
        self.config.init_weights = init;
        self
    }

    pub fn no_decomposition(mut self, enabled: bool) -> Self {
        self.config.no_decomposition = enabled;
        self
    }

    pub fn leave_out(mut self, layers: Vec<usize>) -> Self {
        self.config.leave_out = layers;
        self
    }

    pub fn build(self) -> AdapterResult<LoRAConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Prefix tuning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixTuningConfig {
    pub prefix_length: usize,
    pub bottleneck_size: usize,
    pub non_linearity: ActivationFunction,
    pub dropout: f64,
    /// Learn the prefixes directly instead of through a reparameterizing MLP
    pub flat: bool,
    pub leave_out: Vec<usize>,
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            prefix_length: 30,
            bottleneck_size: 512,
            non_linearity: ActivationFunction::Tanh,
            dropout: 0.0,
            flat: false,
            leave_out: Vec::new(),
        }
    }
}

impl PrefixTuningConfig {
    pub fn validate(&self) -> AdapterResult<()> {
        if self.prefix_length == 0 || self.bottleneck_size == 0 {
            return Err(config_error!(
                "PrefixTuningConfig",
                "prefix_length and bottleneck_size must be positive"
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(config_error!("PrefixTuningConfig", "dropout must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn with_prefix_length(&self, prefix_length: usize) -> Self {
        Self {
            prefix_length,
            ..self.clone()
        }
    }

    pub fn with_flat(&self, flat: bool) -> Self {
        Self {
            flat,
            ..self.clone()
        }
    }
}

/// Closed set of adapter methods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "architecture")]
pub enum AdapterConfig {
    #[serde(rename = "bottleneck")]
    Bottleneck(BottleneckConfig),
    #[serde(rename = "lora")]
    LoRA(LoRAConfig),
    #[serde(rename = "prefix_tuning")]
    PrefixTuning(PrefixTuningConfig),
}

impl AdapterConfig {
    pub fn architecture(&self) -> &'static str {
        match self {
            AdapterConfig::Bottleneck(_) => "bottleneck",
            AdapterConfig::LoRA(_) => "lora",
            AdapterConfig::PrefixTuning(_) => "prefix_tuning",
        }
    }

    pub fn leave_out(&self) -> &[usize] {
        match self {
            AdapterConfig::Bottleneck(c) => &c.leave_out,
            AdapterConfig::LoRA(c) => &c.leave_out,
            AdapterConfig::PrefixTuning(c) => &c.leave_out,
        }
    }

    /// False when `layer_idx` is listed in `leave_out`
    pub fn applies_to_layer(&self, layer_idx: Option<usize>) -> bool {
        match layer_idx {
            Some(idx) => !self.leave_out().contains(&idx),
            None => true,
        }
    }

    pub fn validate(&self) -> AdapterResult<()> {
        match self {
            AdapterConfig::Bottleneck(c) => c.validate(),
            AdapterConfig::LoRA(c) => c.validate(),
            AdapterConfig::PrefixTuning(c) => c.validate(),
        }
    }

    pub fn as_bottleneck(&self) -> Option<&BottleneckConfig> {
        match self {
            AdapterConfig::Bottleneck(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_lora(&self) -> Option<&LoRAConfig> {
        match self {
            AdapterConfig::LoRA(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_prefix_tuning(&self) -> Option<&PrefixTuningConfig> {
        match self {
            AdapterConfig::PrefixTuning(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_mergeable(&self) -> bool {
        matches!(self, AdapterConfig::LoRA(_))
    }
}

impl From<BottleneckConfig> for AdapterConfig {
    fn from(config: BottleneckConfig) -> Self {
        AdapterConfig::Bottleneck(config)
    }
}

impl From<LoRAConfig> for AdapterConfig {
    fn from(config: LoRAConfig) -> Self {
        AdapterConfig::LoRA(config)
    }
}

impl From<PrefixTuningConfig> for AdapterConfig {
    fn from(config: PrefixTuningConfig) -> Self {
        AdapterConfig::PrefixTuning(config)
    }
}

/// Stable content hash: SHA-256 over key-sorted JSON, first 16 hex chars
pub fn config_hash<T: Serialize>(config: &T) -> AdapterResult<String> {
    // serde_json::Value objects are BTreeMaps, so keys come out sorted
    let canonical = serde_json::to_value(config)?.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    Ok(hex)
}
