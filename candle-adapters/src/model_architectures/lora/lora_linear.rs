//! LoRA injection point around a dense projection
//!
//! `LoRALinear` wraps a frozen weight and hosts any number of LoRA / (IA)³
//! adapters, of which at most one takes part in a forward pass and at most
//! one is merged into the weight. Grouped q/k/v projections compute the
//! update per enabled matrix and scatter it into the full output width.

use super::lora_adapter::LoRAAdapter;
use crate::composition::{fusion_name_of, AdapterCompositionBlock};
use crate::config::{AdapterConfig, AdapterFusionConfig, CompositionMode, LoRAConfig};
use crate::core::{ensure_compatible, AdapterError, AdapterResult};
use crate::model_architectures::fusion::{total_regularization_loss, BertFusion};
use crate::model_architectures::traits::{groups, ForwardContext, InjectionPoint};
use crate::{composition_error, config_error, precondition_error};
use candle_core::shape::Dim;
use candle_core::{DType, Tensor, Var, D};
use std::collections::BTreeMap;

/// Attention matrices of a grouped projection, in output order
pub const QKV: [&str; 3] = ["q", "k", "v"];

/// Which sub-module of a transformer layer the projection is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoRALocation {
    /// One of the attention projections; `attn_key` is `q`, `k` or `v`
    SelfAttention { attn_key: String },
    /// Fused q/k/v projection whose output is the three matrices concatenated
    SelfAttentionGrouped,
    Intermediate,
    Output,
}

impl LoRALocation {
    pub fn location_key(&self) -> &'static str {
        match self {
            LoRALocation::SelfAttention { .. } | LoRALocation::SelfAttentionGrouped => "selfattn",
            LoRALocation::Intermediate => "intermediate",
            LoRALocation::Output => "output",
        }
    }

    /// Whether `config` places an adapter at this location
    pub fn accepts(&self, config: &LoRAConfig) -> bool {
        match self {
            LoRALocation::SelfAttention { attn_key } => {
                config.selfattn_lora && config.targets_matrix(attn_key)
            }
            LoRALocation::SelfAttentionGrouped => {
                config.selfattn_lora && QKV.iter().any(|m| config.targets_matrix(m))
            }
            LoRALocation::Intermediate => config.intermediate_lora,
            LoRALocation::Output => config.output_lora,
        }
    }
}

#[derive(Debug)]
struct LoRAEntry {
    adapter: LoRAAdapter,
    /// Enabled q/k/v blocks; `None` for ungrouped projections
    enabled: Option<[bool; 3]>,
}

/// Dense projection hosting LoRA adapters
#[derive(Debug)]
pub struct LoRALinear {
    location: LoRALocation,
    layer_idx: Option<usize>,
    /// Canonical `(out, in)` layout
    weight: Tensor,
    bias: Option<Tensor>,
    fan_in_fan_out: bool,
    in_features: usize,
    out_features: usize,
    attention_probs_dropout_prob: f64,
    loras: BTreeMap<String, LoRAEntry>,
    fusions: BTreeMap<String, BertFusion>,
    merged: Option<String>,
}

impl LoRALinear {
    /// Wrap a weight stored as `(out, in)`
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        location: LoRALocation,
        layer_idx: Option<usize>,
    ) -> AdapterResult<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if location == LoRALocation::SelfAttentionGrouped && out_features % QKV.len() != 0 {
            return Err(config_error!(
                "LoRALinear::new",
                format!("grouped projection width {} is not divisible by 3", out_features)
            ));
        }
        Ok(Self {
            location,
            layer_idx,
            weight,
            bias,
            fan_in_fan_out: false,
            in_features,
            out_features,
            attention_probs_dropout_prob: 0.0,
            loras: BTreeMap::new(),
            fusions: BTreeMap::new(),
            merged: None,
        })
    }

    /// Wrap a weight stored as `(in, out)`
    pub fn from_fan_in_fan_out(
        weight: Tensor,
        bias: Option<Tensor>,
        location: LoRALocation,
        layer_idx: Option<usize>,
    ) -> AdapterResult<Self> {
        let mut layer = Self::new(weight.t()?.contiguous()?, bias, location, layer_idx)?;
        layer.fan_in_fan_out = true;
        Ok(layer)
    }

    /// Dropout applied to fusion attention scores
    pub fn with_fusion_dropout(mut self, prob: f64) -> Self {
        self.attention_probs_dropout_prob = prob;
        self
    }

    /// Weight in the host's layout
    pub fn weight(&self) -> AdapterResult<Tensor> {
        if self.fan_in_fan_out {
            Ok(self.weight.t()?.contiguous()?)
        } else {
            Ok(self.weight.clone())
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn location(&self) -> &LoRALocation {
        &self.location
    }

    pub fn adapter(&self, name: &str) -> Option<&LoRAAdapter> {
        self.loras.get(name).map(|e| &e.adapter)
    }

    fn base_forward(&self, x: &Tensor) -> AdapterResult<Tensor> {
        let out = x.broadcast_matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }

    /// Apply the wrapped projection and the active adapter, if one is present here
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> AdapterResult<Tensor> {
        let base = self.base_forward(x)?;
        if self.merged.is_some() {
            return Ok(base);
        }
        let setup = match ctx.setup_for_layer(self.layer_idx) {
            Some(setup) => unwrap_single_stack(setup),
            None => return Ok(base),
        };

        if let AdapterCompositionBlock::Fuse(children) = setup {
            return self.forward_fuse(x, &base, setup, children, ctx);
        }

        match self.present_names(setup).as_slice() {
            [] => Ok(base),
            [name] => self.apply_adapter(name, x, &base, ctx.train),
            names => Err(composition_error!(
                self.describe(),
                format!(
                    "cannot use {} with LoRA: {} adapters ({}) would be active at once",
                    setup,
                    names.len(),
                    names.join(", ")
                )
            )),
        }
    }

    fn forward_fuse(
        &self,
        x: &Tensor,
        base: &Tensor,
        setup: &AdapterCompositionBlock,
        children: &[AdapterCompositionBlock],
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let mut outputs = Vec::with_capacity(children.len());
        for child in children {
            match self.present_names(child).as_slice() {
                [] => {}
                [name] => outputs.push(self.apply_adapter(name, x, base, ctx.train)?),
                names => {
                    return Err(composition_error!(
                        self.describe(),
                        format!("fused child {} activates {} LoRA adapters", child, names.len())
                    ))
                }
            }
        }
        if outputs.is_empty() {
            return Ok(base.clone());
        }
        let fusion_name = fusion_name_of(&setup.flatten());
        let fusion = self.fusions.get(&fusion_name).ok_or_else(|| {
            composition_error!(
                self.describe(),
                format!("no fusion layer '{}' for {}", fusion_name, setup)
            )
        })?;
        let stacked = Tensor::stack(&outputs, 2)?;
        fusion.forward(base, &stacked, &stacked, base, ctx.train)
    }

    fn present_names(&self, block: &AdapterCompositionBlock) -> Vec<String> {
        block
            .flatten()
            .into_iter()
            .filter(|n| self.loras.contains_key(n))
            .collect()
    }

    fn apply_adapter(&self, name: &str, x: &Tensor, base: &Tensor, train: bool) -> AdapterResult<Tensor> {
        let entry = self
            .loras
            .get(name)
            .ok_or_else(|| crate::core::lookup_errors::unknown_adapter_in(name, &self.describe()))?;
        ensure_compatible(&self.describe(), &self.weight, entry.adapter.lora_a().as_tensor())?;
        let deltas = entry.adapter.delta_output_groups(x, train)?;
        let delta = self.scatter(entry, deltas, D::Minus1)?;
        Ok(entry.adapter.com(base, &delta)?)
    }

    /// Place per-group updates at their q/k/v slots, padding the rest with the
    /// neutral element of the composition mode
    fn scatter(&self, entry: &LoRAEntry, mut deltas: Vec<Tensor>, dim: D) -> AdapterResult<Tensor> {
        let enabled = match entry.enabled {
            None => return Ok(deltas.remove(0)),
            Some(enabled) => enabled,
        };
        let mut deltas = deltas.into_iter();
        let mut pieces = Vec::with_capacity(QKV.len());
        let mut template: Option<Tensor> = None;
        let mut slots: Vec<Option<Tensor>> = Vec::with_capacity(QKV.len());
        for on in enabled {
            if on {
                let delta = deltas
                    .next()
                    .ok_or_else(|| precondition_error!(self.describe(), "missing group update"))?;
                template.get_or_insert_with(|| delta.clone());
                slots.push(Some(delta));
            } else {
                slots.push(None);
            }
        }
        let template = template.ok_or_else(|| precondition_error!(self.describe(), "no enabled group"))?;
        for slot in slots {
            match slot {
                Some(delta) => pieces.push(delta),
                None => pieces.push(match entry.adapter.composition_mode() {
                    CompositionMode::Add => template.zeros_like()?,
                    CompositionMode::Scale => template.ones_like()?,
                }),
            }
        }
        let dim = dim.to_index(template.shape(), "lora scatter")?;
        Ok(Tensor::cat(&pieces, dim)?)
    }

    fn delta_weight(&self, entry: &LoRAEntry) -> AdapterResult<Tensor> {
        let deltas = entry.adapter.delta_weight_groups()?;
        self.scatter(entry, deltas, D::Minus2)
    }

    fn describe(&self) -> String {
        match self.layer_idx {
            Some(idx) => format!("layer {} {}", idx, self.location.location_key()),
            None => self.location.location_key().to_string(),
        }
    }
}

fn unwrap_single_stack(block: &AdapterCompositionBlock) -> &AdapterCompositionBlock {
    match block {
        AdapterCompositionBlock::Stack(children) if children.len() == 1 => &children[0],
        other => other,
    }
}

fn contains_zero(t: &Tensor) -> AdapterResult<bool> {
    let min = t
        .abs()?
        .flatten_all()?
        .min(0)?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(min == 0.0)
}

impl InjectionPoint for LoRALinear {
    fn location_key(&self) -> &str {
        self.location.location_key()
    }

    fn layer_idx(&self) -> Option<usize> {
        self.layer_idx
    }

    fn parameter_group(&self) -> &'static str {
        groups::LORAS
    }

    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool> {
        let lora_config = match config.as_lora() {
            Some(c) if config.applies_to_layer(self.layer_idx) && self.location.accepts(c) => c,
            _ => return Ok(false),
        };
        let (out_per_group, groups, enabled) = match self.location {
            LoRALocation::SelfAttentionGrouped => {
                let enabled = [
                    lora_config.targets_matrix("q"),
                    lora_config.targets_matrix("k"),
                    lora_config.targets_matrix("v"),
                ];
                let groups = enabled.iter().filter(|e| **e).count();
                (self.out_features / QKV.len(), groups, Some(enabled))
            }
            _ => (self.out_features, 1, None),
        };
        let adapter = LoRAAdapter::new(
            self.in_features,
            out_per_group,
            groups,
            lora_config,
            self.weight.device(),
            self.weight.dtype(),
        )?;
        self.loras
            .insert(name.to_string(), LoRAEntry { adapter, enabled });
        Ok(true)
    }

    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        if self.merged.as_deref() == Some(name) {
            self.reset_adapter()?;
        }
        self.loras.remove(name);
        Ok(())
    }

    fn has_adapter(&self, name: &str) -> bool {
        self.loras.contains_key(name)
    }

    fn adapter_names(&self) -> Vec<String> {
        self.loras.keys().cloned().collect()
    }

    fn adapter_parameters(&self, name: &str) -> Vec<(String, Var)> {
        self.loras
            .get(name)
            .map(|e| e.adapter.named_vars())
            .unwrap_or_default()
    }

    fn add_fusion_layer(&mut self, adapter_names: &[String], config: &AdapterFusionConfig) -> AdapterResult<bool> {
        if !adapter_names.iter().any(|n| self.loras.contains_key(n)) {
            return Ok(false);
        }
        let fusion = BertFusion::new(
            self.out_features,
            config,
            self.attention_probs_dropout_prob,
            self.weight.device(),
            self.weight.dtype(),
        )?;
        self.fusions.insert(fusion_name_of(adapter_names), fusion);
        Ok(true)
    }

    fn delete_fusion_layer(&mut self, fusion_name: &str) -> AdapterResult<()> {
        self.fusions.remove(fusion_name);
        Ok(())
    }

    fn fusion_names(&self) -> Vec<String> {
        self.fusions.keys().cloned().collect()
    }

    fn fusion_parameters(&self, fusion_name: &str) -> Vec<(String, Var)> {
        self.fusions
            .get(fusion_name)
            .map(|f| f.named_vars())
            .unwrap_or_default()
    }

    fn fusion_regularization_loss(&self) -> AdapterResult<Option<Tensor>> {
        total_regularization_loss(self.fusions.values())
    }

    fn merge_adapter(&mut self, name: &str) -> AdapterResult<bool> {
        let entry = match self.loras.get(name) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        match self.merged.as_deref() {
            Some(merged) if merged == name => return Ok(true),
            Some(merged) => {
                return Err(AdapterError::AlreadyMerged {
                    location: self.describe(),
                    merged: merged.to_string(),
                    requested: name.to_string(),
                })
            }
            None => {}
        }
        ensure_compatible("merge_adapter", &self.weight, entry.adapter.lora_a().as_tensor())?;
        let delta = self.delta_weight(entry)?;
        if entry.adapter.composition_mode() == CompositionMode::Scale
            && (entry.adapter.scaling() == 0.0 || contains_zero(&delta)?)
        {
            return Err(precondition_error!(
                "merge_adapter",
                format!(
                    "scale-mode update of '{}' at {} has zero entries, the merge would not be invertible",
                    name,
                    self.describe()
                )
            ));
        }
        self.weight = entry.adapter.com(&self.weight, &delta)?.detach();
        self.merged = Some(name.to_string());
        Ok(true)
    }

    fn reset_adapter(&mut self) -> AdapterResult<()> {
        let name = match self.merged.take() {
            Some(name) => name,
            None => return Ok(()),
        };
        if let Some(entry) = self.loras.get(&name) {
            let delta = self.delta_weight(entry)?;
            self.weight = entry.adapter.com_inv(&self.weight, &delta)?.detach();
        }
        Ok(())
    }

    fn merged_adapter(&self) -> Option<&str> {
        self.merged.as_deref()
    }
}
