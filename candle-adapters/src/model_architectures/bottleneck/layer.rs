//! Bottleneck injection point
//!
//! Sits after the attention output projection (`mh_adapter`) or the
//! feed-forward output projection (`output_adapter`) of a transformer layer,
//! right where the host adds its residual and applies its layer norm. Every
//! composition operator is interpreted here.

use super::adapter::BottleneckAdapter;
use crate::composition::{fusion_name_of, AdapterCompositionBlock};
use crate::config::{AdapterConfig, AdapterFusionConfig};
use crate::core::AdapterResult;
use crate::model_architectures::fusion::{total_regularization_loss, BertFusion};
use crate::model_architectures::parameters::LayerNorm;
use crate::model_architectures::traits::{groups, ForwardContext, InjectionPoint};
use crate::composition_error;
use candle_core::{DType, Device, Module, Tensor, Var};
use std::collections::BTreeMap;
use tracing::debug;

/// Position of a bottleneck point inside the transformer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottleneckLocation {
    /// After multi-head attention
    MultiHead,
    /// After the feed-forward block
    Output,
}

impl BottleneckLocation {
    pub fn location_key(&self) -> &'static str {
        match self {
            BottleneckLocation::MultiHead => "mh_adapter",
            BottleneckLocation::Output => "output_adapter",
        }
    }
}

/// Intermediate result of interpreting one composition block
struct Composed {
    hidden: Tensor,
    /// Up projection of the last adapter, consumed by fusion
    up: Option<Tensor>,
    /// Host input tensor, replaced when a Parallel block replicates the batch
    input: Tensor,
}

impl Composed {
    fn unchanged(hidden: &Tensor, input: &Tensor) -> Self {
        Self {
            hidden: hidden.clone(),
            up: None,
            input: input.clone(),
        }
    }

    fn hidden_only(hidden: Tensor, input: &Tensor) -> Self {
        Self {
            hidden,
            up: None,
            input: input.clone(),
        }
    }
}

#[derive(Debug)]
pub struct BottleneckLayer {
    location: BottleneckLocation,
    layer_idx: Option<usize>,
    hidden_size: usize,
    layer_norm_eps: f64,
    attention_probs_dropout_prob: f64,
    device: Device,
    dtype: DType,
    adapters: BTreeMap<String, BottleneckAdapter>,
    fusions: BTreeMap<String, BertFusion>,
}

impl BottleneckLayer {
    pub fn new(
        location: BottleneckLocation,
        layer_idx: Option<usize>,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Self {
        Self {
            location,
            layer_idx,
            hidden_size,
            layer_norm_eps: 1e-12,
            attention_probs_dropout_prob: 0.0,
            device: device.clone(),
            dtype,
            adapters: BTreeMap::new(),
            fusions: BTreeMap::new(),
        }
    }

    pub fn with_layer_norm_eps(mut self, eps: f64) -> Self {
        self.layer_norm_eps = eps;
        self
    }

    pub fn with_fusion_dropout(mut self, prob: f64) -> Self {
        self.attention_probs_dropout_prob = prob;
        self
    }

    pub fn location(&self) -> BottleneckLocation {
        self.location
    }

    pub fn adapter(&self, name: &str) -> Option<&BottleneckAdapter> {
        self.adapters.get(name)
    }

    pub fn fusion(&self, fusion_name: &str) -> Option<&BertFusion> {
        self.fusions.get(fusion_name)
    }

    /// Run the active setup on `hidden_states`, then finish the host's
    /// residual connection with `input_tensor` and `layer_norm`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let setup = ctx.setup_for_layer(self.layer_idx);
        let (setup, last) = match setup.and_then(|s| self.last_present(s).map(|l| (s, l))) {
            Some(found) => found,
            None => return Self::bypass(hidden_states, input_tensor, layer_norm),
        };

        let composed = self.compose(setup, hidden_states, input_tensor, layer_norm, ctx)?;
        let last_adapter = &self.adapters[last];
        Ok(last_adapter.post_forward(&composed.hidden, &composed.input, layer_norm)?)
    }

    fn bypass(hidden_states: &Tensor, input_tensor: &Tensor, layer_norm: Option<&LayerNorm>) -> AdapterResult<Tensor> {
        let summed = hidden_states.add(input_tensor)?;
        match layer_norm {
            Some(ln) => Ok(ln.forward(&summed)?),
            None => Ok(summed),
        }
    }

    /// Last leaf of `block` hosted here; the block's own last leaf when hosted
    fn last_present<'a>(&self, block: &'a AdapterCompositionBlock) -> Option<&'a str> {
        if let Some(last) = block.last() {
            if self.adapters.contains_key(last) {
                return Some(last);
            }
        }
        let mut leaves = Vec::new();
        collect_leaves(block, &mut leaves);
        leaves
            .into_iter()
            .rev()
            .find(|name| self.adapters.contains_key(*name))
    }

    fn compose(
        &self,
        block: &AdapterCompositionBlock,
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Composed> {
        match block {
            AdapterCompositionBlock::Adapter(name) => self.compose_single(name, hidden, input, layer_norm),
            AdapterCompositionBlock::Stack(children) => {
                self.compose_stack(children, hidden, input, layer_norm, ctx)
            }
            AdapterCompositionBlock::Fuse(children) => {
                let fused = self.compose_fuse(block, children, hidden, input, layer_norm, ctx)?;
                Ok(Composed::hidden_only(fused, input))
            }
            AdapterCompositionBlock::Split { children, splits } => {
                let split = self.compose_split(children, splits, hidden, input, layer_norm, ctx)?;
                Ok(Composed::hidden_only(split, input))
            }
            AdapterCompositionBlock::Parallel(children) => {
                self.compose_parallel(children, hidden, input, layer_norm, ctx)
            }
            AdapterCompositionBlock::BatchSplit {
                children,
                batch_sizes,
            } => {
                let split = self.compose_batch_split(children, batch_sizes, hidden, input, layer_norm, ctx)?;
                Ok(Composed::hidden_only(split, input))
            }
            AdapterCompositionBlock::Average { children, weights } => {
                let averaged = self.compose_average(children, weights, hidden, input, layer_norm, ctx)?;
                Ok(Composed::hidden_only(averaged, input))
            }
        }
    }

    fn compose_single(
        &self,
        name: &str,
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
    ) -> AdapterResult<Composed> {
        let adapter = match self.adapters.get(name) {
            Some(adapter) => adapter,
            None => return Ok(Composed::unchanged(hidden, input)),
        };
        let (hidden, _, residual) = adapter.pre_forward(hidden, input, layer_norm, None)?;
        let output = adapter.forward(&hidden, &residual)?;
        Ok(Composed {
            hidden: output.hidden_states,
            up: Some(output.up),
            input: input.clone(),
        })
    }

    /// Children in sequence; each sees the previous child's output
    fn compose_stack(
        &self,
        children: &[AdapterCompositionBlock],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Composed> {
        let mut state = Composed::unchanged(hidden, input);
        for child in children {
            state = self.compose(child, &state.hidden, &state.input, layer_norm, ctx)?;
        }
        Ok(state)
    }

    fn compose_fuse(
        &self,
        block: &AdapterCompositionBlock,
        children: &[AdapterCompositionBlock],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let last = match self.last_present(block) {
            Some(last) => last,
            None => return Ok(hidden.clone()),
        };
        let fusion_name = fusion_name_of(&block.flatten());
        let fusion = self.fusions.get(&fusion_name).ok_or_else(|| {
            composition_error!(
                self.describe(),
                format!("no fusion layer '{}' for {}", fusion_name, block)
            )
        })?;

        let (hidden, query, residual) =
            self.adapters[last].pre_forward(hidden, input, layer_norm, Some(fusion.config()))?;

        let mut ups = Vec::with_capacity(children.len());
        for child in children {
            match child {
                AdapterCompositionBlock::Adapter(name) => {
                    if let Some(adapter) = self.adapters.get(name) {
                        ups.push(adapter.forward(&hidden, &residual)?.up);
                    }
                }
                _ => {
                    if let Some(up) = self.compose(child, &hidden, input, layer_norm, ctx)?.up {
                        ups.push(up);
                    }
                }
            }
        }
        if ups.is_empty() {
            return Ok(hidden);
        }

        let stacked = Tensor::stack(&ups, 2)?;
        let query = query.unwrap_or_else(|| hidden.clone());
        fusion.forward(&query, &stacked, &stacked, &residual, ctx.train)
    }

    /// Sequence positions `[b_i, b_{i+1})` go to child `i`
    fn compose_split(
        &self,
        children: &[AdapterCompositionBlock],
        splits: &[usize],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let seq_len = hidden.dim(1)?;
        if splits.iter().any(|s| *s >= seq_len) {
            return Err(composition_error!(
                self.describe(),
                format!("split indices {:?} exceed sequence length {}", splits, seq_len)
            ));
        }
        let mut bounds = Vec::with_capacity(splits.len() + 2);
        bounds.push(0);
        bounds.extend_from_slice(splits);
        bounds.push(seq_len);

        let mut pieces = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            let (start, len) = (bounds[i], bounds[i + 1] - bounds[i]);
            let h = hidden.narrow(1, start, len)?;
            let x = input.narrow(1, start, len)?;
            pieces.push(self.compose(child, &h, &x, layer_norm, ctx)?.hidden);
        }
        Ok(Tensor::cat(&pieces, 1)?)
    }

    /// Replicate the batch once per child (first Parallel only), then child
    /// `i` processes replica `i`
    fn compose_parallel(
        &self,
        children: &[AdapterCompositionBlock],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Composed> {
        let channels = children.len();
        let (hidden, input) = if !ctx.is_parallelized() {
            ctx.mark_parallelized();
            debug!("replicating batch {} times at {}", channels, self.describe());
            (hidden.repeat((channels, 1, 1))?, input.repeat((channels, 1, 1))?)
        } else {
            if hidden.dim(0)? % channels != 0 {
                return Err(composition_error!(
                    self.describe(),
                    format!(
                        "batch size {} is not a multiple of {} parallel channels",
                        hidden.dim(0)?,
                        channels
                    )
                ));
            }
            (hidden.clone(), input.clone())
        };
        let orig_batch = hidden.dim(0)? / channels;

        let mut pieces = Vec::with_capacity(channels);
        for (i, child) in children.iter().enumerate() {
            let h = hidden.narrow(0, i * orig_batch, orig_batch)?;
            let x = input.narrow(0, i * orig_batch, orig_batch)?;
            pieces.push(self.compose(child, &h, &x, layer_norm, ctx)?.hidden);
        }
        Ok(Composed {
            hidden: Tensor::cat(&pieces, 0)?,
            up: None,
            input,
        })
    }

    fn compose_batch_split(
        &self,
        children: &[AdapterCompositionBlock],
        batch_sizes: &[usize],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let batch = hidden.dim(0)?;
        let total: usize = batch_sizes.iter().sum();
        if total != batch {
            return Err(composition_error!(
                self.describe(),
                format!(
                    "batch sizes {:?} sum to {} but the batch has {} rows",
                    batch_sizes, total, batch
                )
            ));
        }

        let mut pieces = Vec::with_capacity(children.len());
        let mut offset = 0;
        for (child, size) in children.iter().zip(batch_sizes) {
            if *size > 0 {
                let h = hidden.narrow(0, offset, *size)?;
                let x = input.narrow(0, offset, *size)?;
                pieces.push(self.compose(child, &h, &x, layer_norm, ctx)?.hidden);
            }
            offset += size;
        }
        Ok(Tensor::cat(&pieces, 0)?)
    }

    /// Weighted sum of the children's outputs on the same input
    fn compose_average(
        &self,
        children: &[AdapterCompositionBlock],
        weights: &[f64],
        hidden: &Tensor,
        input: &Tensor,
        layer_norm: Option<&LayerNorm>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let mut acc: Option<Tensor> = None;
        for (child, weight) in children.iter().zip(weights) {
            let out = self.compose(child, hidden, input, layer_norm, ctx)?.hidden;
            let scaled = out.affine(*weight, 0.0)?;
            acc = Some(match acc {
                Some(a) => a.add(&scaled)?,
                None => scaled,
            });
        }
        acc.ok_or_else(|| composition_error!(self.describe(), "Average block has no children"))
    }

    fn describe(&self) -> String {
        match self.layer_idx {
            Some(idx) => format!("layer {} {}", idx, self.location.location_key()),
            None => self.location.location_key().to_string(),
        }
    }
}

fn collect_leaves<'a>(block: &'a AdapterCompositionBlock, out: &mut Vec<&'a str>) {
    match block {
        AdapterCompositionBlock::Adapter(name) => out.push(name),
        other => {
            for child in other.children() {
                collect_leaves(child, out);
            }
        }
    }
}

impl InjectionPoint for BottleneckLayer {
    fn location_key(&self) -> &str {
        self.location.location_key()
    }

    fn layer_idx(&self) -> Option<usize> {
        self.layer_idx
    }

    fn parameter_group(&self) -> &'static str {
        groups::ADAPTERS
    }

    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool> {
        let bottleneck = match config.as_bottleneck() {
            Some(c) if config.applies_to_layer(self.layer_idx) => c,
            _ => return Ok(false),
        };
        let wanted = match self.location {
            BottleneckLocation::MultiHead => bottleneck.mh_adapter,
            BottleneckLocation::Output => bottleneck.output_adapter,
        };
        if !wanted {
            return Ok(false);
        }
        let factor = bottleneck
            .reduction_factor
            .for_layer(self.layer_idx.unwrap_or(0))?;
        let down_sample = (self.hidden_size as f64 / factor) as usize;
        let adapter = BottleneckAdapter::new(
            self.hidden_size,
            down_sample,
            bottleneck,
            self.layer_norm_eps,
            &self.device,
            self.dtype,
        )?;
        self.adapters.insert(name.to_string(), adapter);
        Ok(true)
    }

    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        self.adapters.remove(name);
        Ok(())
    }

    fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    fn adapter_parameters(&self, name: &str) -> Vec<(String, Var)> {
        self.adapters
            .get(name)
            .map(|a| a.named_vars())
            .unwrap_or_default()
    }

    fn add_fusion_layer(&mut self, adapter_names: &[String], config: &AdapterFusionConfig) -> AdapterResult<bool> {
        if !adapter_names.iter().any(|n| self.adapters.contains_key(n)) {
            return Ok(false);
        }
        let fusion = BertFusion::new(
            self.hidden_size,
            config,
            self.attention_probs_dropout_prob,
            &self.device,
            self.dtype,
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
}
