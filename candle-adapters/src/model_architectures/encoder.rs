//! Reference BERT-style host encoder
//!
//! A compact transformer encoder whose projections, attention and layer
//! outputs are injection points. Weight names follow the BERT checkpoint
//! layout, so `from_pretrained` can load a BERT `model.safetensors`, and
//! `new_random` builds a randomly initialized encoder for tests.
//!
//! Injection point paths, per layer `i`:
//! - `encoder.layer.{i}.attention.self.{query,key,value}` (LoRA)
//! - `encoder.layer.{i}.attention.self` (prefix tuning)
//! - `encoder.layer.{i}.attention.output` (`mh_adapter`)
//! - `encoder.layer.{i}.intermediate.dense` / `encoder.layer.{i}.output.dense` (LoRA)
//! - `encoder.layer.{i}.output` (`output_adapter`)
//!
//! and model-wide `embeddings` (invertible adapters) and `prefix_tuning`.

use crate::core::{AdapterResult, BundleLoader, ErrorUnification};
use crate::model_architectures::activation::ActivationFunction;
use crate::model_architectures::bottleneck::{BottleneckLayer, BottleneckLocation, InvertibleAdaptersLayer};
use crate::model_architectures::lora::{LoRALinear, LoRALocation};
use crate::model_architectures::parameters::LayerNorm;
use crate::model_architectures::prefix_tuning::{PrefixStates, PrefixTuningLayer, PrefixTuningPool};
use crate::model_architectures::traits::{AdapterInjection, ForwardContext, InjectionPoint};
use crate::config_error;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const MODEL_CONFIG_NAME: &str = "config.json";
pub const MODEL_WEIGHTS_NAME: &str = "model.safetensors";

/// BERT `config.json` subset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: ActivationFunction,
    pub hidden_dropout_prob: f64,
    pub attention_probs_dropout_prob: f64,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    pub pad_token_id: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: ActivationFunction::Gelu,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> AdapterResult<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(config_error!(
                "EncoderConfig",
                format!(
                    "hidden_size {} is not a multiple of num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                )
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Every base weight with its shape, in checkpoint naming
    pub fn weight_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let (h, i) = (self.hidden_size, self.intermediate_size);
        let mut shapes = vec![
            ("embeddings.word_embeddings.weight".to_string(), vec![self.vocab_size, h]),
            ("embeddings.position_embeddings.weight".to_string(), vec![self.max_position_embeddings, h]),
            ("embeddings.token_type_embeddings.weight".to_string(), vec![self.type_vocab_size, h]),
            ("embeddings.LayerNorm.weight".to_string(), vec![h]),
            ("embeddings.LayerNorm.bias".to_string(), vec![h]),
        ];
        for layer in 0..self.num_hidden_layers {
            let p = format!("encoder.layer.{}", layer);
            for (name, out_dim, in_dim) in [
                ("attention.self.query", h, h),
                ("attention.self.key", h, h),
                ("attention.self.value", h, h),
                ("attention.output.dense", h, h),
                ("intermediate.dense", i, h),
                ("output.dense", h, i),
            ] {
                shapes.push((format!("{}.{}.weight", p, name), vec![out_dim, in_dim]));
                shapes.push((format!("{}.{}.bias", p, name), vec![out_dim]));
            }
            for norm in ["attention.output.LayerNorm", "output.LayerNorm"] {
                shapes.push((format!("{}.{}.weight", p, norm), vec![h]));
                shapes.push((format!("{}.{}.bias", p, norm), vec![h]));
            }
        }
        shapes
    }
}

fn load_layer_norm(vb: &VarBuilder, size: usize, eps: f64) -> AdapterResult<LayerNorm> {
    Ok(LayerNorm::frozen(vb.get(size, "weight")?, vb.get(size, "bias")?, eps))
}

fn load_linear(vb: &VarBuilder, in_dim: usize, out_dim: usize) -> AdapterResult<(Tensor, Tensor)> {
    Ok((vb.get((out_dim, in_dim), "weight")?, vb.get(out_dim, "bias")?))
}

#[derive(Debug)]
struct EncoderLayer {
    query: LoRALinear,
    key: LoRALinear,
    value: LoRALinear,
    prefix: PrefixTuningLayer,
    attention_dense: Linear,
    attention_norm: LayerNorm,
    attention_adapters: BottleneckLayer,
    intermediate: LoRALinear,
    output_dense: LoRALinear,
    output_norm: LayerNorm,
    output_adapters: BottleneckLayer,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, config: &EncoderConfig, idx: usize) -> AdapterResult<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        let attn = vb.pp("attention");
        let projection = |name: &str, attn_key: &str| -> AdapterResult<LoRALinear> {
            let (w, b) = load_linear(&attn.pp("self").pp(name), h, h)?;
            Ok(LoRALinear::new(
                w,
                Some(b),
                LoRALocation::SelfAttention {
                    attn_key: attn_key.to_string(),
                },
                Some(idx),
            )?
            .with_fusion_dropout(config.attention_probs_dropout_prob))
        };
        let query = projection("query", "q")?;
        let key = projection("key", "k")?;
        let value = projection("value", "v")?;

        let (w, b) = load_linear(&attn.pp("output").pp("dense"), h, h)?;
        let attention_dense = Linear::new(w, Some(b));
        let attention_norm = load_layer_norm(&attn.pp("output").pp("LayerNorm"), h, config.layer_norm_eps)?;

        let (w, b) = load_linear(&vb.pp("intermediate").pp("dense"), h, i)?;
        let intermediate = LoRALinear::new(w, Some(b), LoRALocation::Intermediate, Some(idx))?;
        let (w, b) = load_linear(&vb.pp("output").pp("dense"), i, h)?;
        let output_dense = LoRALinear::new(w, Some(b), LoRALocation::Output, Some(idx))?;
        let output_norm = load_layer_norm(&vb.pp("output").pp("LayerNorm"), h, config.layer_norm_eps)?;

        let bottleneck = |location| {
            BottleneckLayer::new(location, Some(idx), h, vb.device(), vb.dtype())
                .with_layer_norm_eps(config.layer_norm_eps)
                .with_fusion_dropout(config.attention_probs_dropout_prob)
        };

        Ok(Self {
            query,
            key,
            value,
            prefix: PrefixTuningLayer::new(idx),
            attention_dense,
            attention_norm,
            attention_adapters: bottleneck(BottleneckLocation::MultiHead),
            intermediate,
            output_dense,
            output_norm,
            output_adapters: bottleneck(BottleneckLocation::Output),
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        prefix_states: &PrefixStates,
        config: &EncoderConfig,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;
        let (heads, head_dim) = (config.num_attention_heads, config.head_dim());
        let split_heads = |t: Tensor| -> AdapterResult<Tensor> {
            Ok(t.reshape((batch, seq_len, heads, head_dim))?.transpose(1, 2)?.contiguous()?)
        };

        let query = split_heads(self.query.forward(hidden_states, ctx)?)?;
        let key = split_heads(self.key.forward(hidden_states, ctx)?)?;
        let value = split_heads(self.value.forward(hidden_states, ctx)?)?;
        let (key, value, mask) = self
            .prefix
            .forward(&key, &value, attention_mask, prefix_states, ctx)?;

        let mut scores = query
            .matmul(&key.transpose(2, 3)?.contiguous()?)?
            .affine(1.0 / (head_dim as f64).sqrt(), 0.0)?;
        if let Some(mask) = &mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = Dropout::new(config.attention_probs_dropout_prob as f32).forward(&probs, ctx.train)?;
        let context = probs
            .matmul(&value.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, config.hidden_size))?;

        let hidden_dropout = Dropout::new(config.hidden_dropout_prob as f32);
        let attention_output = hidden_dropout.forward(&self.attention_dense.forward(&context)?, ctx.train)?;
        let attention_output =
            self.attention_adapters
                .forward(&attention_output, hidden_states, Some(&self.attention_norm), ctx)?;

        let intermediate = config
            .hidden_act
            .apply(&self.intermediate.forward(&attention_output, ctx)?)?;
        let output = hidden_dropout.forward(&self.output_dense.forward(&intermediate, ctx)?, ctx.train)?;
        self.output_adapters
            .forward(&output, &attention_output, Some(&self.output_norm), ctx)
    }
}

/// Randomly initialized or checkpoint-loaded encoder implementing [`AdapterInjection`]
#[derive(Debug)]
pub struct AdapterEncoder {
    config: EncoderConfig,
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    embeddings_norm: LayerNorm,
    invertible_adapters: InvertibleAdaptersLayer,
    prefix_tuning: PrefixTuningPool,
    layers: Vec<EncoderLayer>,
    device: Device,
    dtype: DType,
}

impl AdapterEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> AdapterResult<Self> {
        config.validate()?;
        let h = config.hidden_size;
        let emb = vb.pp("embeddings");
        let word_embeddings = Embedding::new(emb.pp("word_embeddings").get((config.vocab_size, h), "weight")?, h);
        let position_embeddings = Embedding::new(
            emb.pp("position_embeddings")
                .get((config.max_position_embeddings, h), "weight")?,
            h,
        );
        let token_type_embeddings = Embedding::new(
            emb.pp("token_type_embeddings")
                .get((config.type_vocab_size, h), "weight")?,
            h,
        );
        let embeddings_norm = load_layer_norm(&emb.pp("LayerNorm"), h, config.layer_norm_eps)?;

        let layers = (0..config.num_hidden_layers)
            .map(|idx| EncoderLayer::load(vb.pp("encoder").pp("layer").pp(idx.to_string()), config, idx))
            .collect::<AdapterResult<Vec<_>>>()?;

        let device = vb.device().clone();
        let dtype = vb.dtype();
        Ok(Self {
            config: config.clone(),
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embeddings_norm,
            invertible_adapters: InvertibleAdaptersLayer::new(h, &device, dtype),
            prefix_tuning: PrefixTuningPool::new(
                config.num_hidden_layers,
                config.num_attention_heads,
                h,
                &device,
                dtype,
            ),
            layers,
            device,
            dtype,
        })
    }

    /// Encoder with N(0, 0.02) weights and identity layer norms
    pub fn new_random(config: &EncoderConfig, device: &Device) -> AdapterResult<Self> {
        let mut tensors = HashMap::new();
        for (name, shape) in config.weight_shapes() {
            let tensor = if name.ends_with("LayerNorm.weight") {
                Tensor::ones(shape, DType::F32, device)?
            } else if name.ends_with(".bias") || name.contains("LayerNorm") {
                Tensor::zeros(shape, DType::F32, device)?
            } else {
                Tensor::randn(0f32, 0.02, shape, device)?
            };
            tensors.insert(name, tensor);
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    /// Load `config.json` and `model.safetensors` from a BERT checkpoint directory
    pub fn from_pretrained(dir: &Path, device: &Device) -> AdapterResult<Self> {
        let config: EncoderConfig = BundleLoader::load_json_config(dir, MODEL_CONFIG_NAME)?;
        let weights = dir.join(MODEL_WEIGHTS_NAME);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, device) }
            .with_io_context("mmap model weights", Some(&weights.display().to_string()))?;
        info!(
            "Loaded encoder from {} ({} layers, hidden size {})",
            dir.display(),
            config.num_hidden_layers,
            config.hidden_size
        );
        Self::new(&config, vb)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn embed(&self, input_ids: &Tensor, ctx: &ForwardContext) -> AdapterResult<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;
        let embeddings = self
            .word_embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?
            .add(&self.token_type_embeddings.forward(&token_type_ids)?)?;
        let embeddings = self.embeddings_norm.forward(&embeddings)?;
        let embeddings =
            Dropout::new(self.config.hidden_dropout_prob as f32).forward(&embeddings, ctx.train)?;
        self.invertible_adapters.forward(&embeddings, ctx)
    }

    /// `(batch, seq)` 1/0 mask to an additive `(batch, 1, 1, seq)` mask
    fn extended_mask(&self, attention_mask: &Tensor) -> AdapterResult<Tensor> {
        let (batch, seq_len) = attention_mask.dims2()?;
        Ok(attention_mask
            .to_dtype(self.dtype)?
            .affine(10000.0, -10000.0)?
            .reshape((batch, 1, 1, seq_len))?)
    }
}

impl AdapterInjection for AdapterEncoder {
    fn model_type(&self) -> &str {
        "bert"
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn num_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn injection_points(&self) -> Vec<(String, &dyn InjectionPoint)> {
        let mut points: Vec<(String, &dyn InjectionPoint)> = Vec::new();
        points.push(("embeddings".to_string(), &self.invertible_adapters as &dyn InjectionPoint));
        points.push(("prefix_tuning".to_string(), &self.prefix_tuning as &dyn InjectionPoint));
        for (idx, layer) in self.layers.iter().enumerate() {
            let p = format!("encoder.layer.{}", idx);
            let layer_points: [(&str, &dyn InjectionPoint); 8] = [
                ("attention.self.query", &layer.query),
                ("attention.self.key", &layer.key),
                ("attention.self.value", &layer.value),
                ("attention.self", &layer.prefix),
                ("attention.output", &layer.attention_adapters),
                ("intermediate.dense", &layer.intermediate),
                ("output.dense", &layer.output_dense),
                ("output", &layer.output_adapters),
            ];
            for (suffix, point) in layer_points {
                points.push((format!("{}.{}", p, suffix), point));
            }
        }
        points
    }

    fn injection_points_mut(&mut self) -> Vec<(String, &mut dyn InjectionPoint)> {
        let mut points: Vec<(String, &mut dyn InjectionPoint)> = Vec::new();
        points.push((
            "embeddings".to_string(),
            &mut self.invertible_adapters as &mut dyn InjectionPoint,
        ));
        points.push((
            "prefix_tuning".to_string(),
            &mut self.prefix_tuning as &mut dyn InjectionPoint,
        ));
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            let p = format!("encoder.layer.{}", idx);
            let EncoderLayer {
                query,
                key,
                value,
                prefix,
                attention_adapters,
                intermediate,
                output_dense,
                output_adapters,
                ..
            } = layer;
            let layer_points: [(&str, &mut dyn InjectionPoint); 8] = [
                ("attention.self.query", query),
                ("attention.self.key", key),
                ("attention.self.value", value),
                ("attention.self", prefix),
                ("attention.output", attention_adapters),
                ("intermediate.dense", intermediate),
                ("output.dense", output_dense),
                ("output", output_adapters),
            ];
            for (suffix, point) in layer_points {
                points.push((format!("{}.{}", p, suffix), point));
            }
        }
        points
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> AdapterResult<Tensor> {
        let (batch, _) = input_ids.dims2()?;
        let mut hidden_states = self.embed(input_ids, ctx)?;
        let mut mask = attention_mask.map(|m| self.extended_mask(m)).transpose()?;
        let prefix_states = self.prefix_tuning.forward(batch, ctx)?;

        for layer in &self.layers {
            // a Parallel block enlarges the batch; the mask follows
            if let Some(m) = &mask {
                let (hidden_batch, mask_batch) = (hidden_states.dim(0)?, m.dim(0)?);
                if hidden_batch != mask_batch && mask_batch > 0 && hidden_batch % mask_batch == 0 {
                    mask = Some(m.repeat((hidden_batch / mask_batch, 1, 1, 1))?);
                }
            }
            hidden_states = layer.forward(&hidden_states, mask.as_ref(), &prefix_states, &self.config, ctx)?;
        }
        Ok(hidden_states)
    }

    fn invert_hidden_states(&self, hidden_states: &Tensor, ctx: &ForwardContext) -> AdapterResult<Tensor> {
        self.invertible_adapters.inverse(hidden_states, ctx)
    }
}
