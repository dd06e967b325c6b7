//! Prefix tuning
//!
//! `PrefixTuningPool` owns one prefix generator per adapter and produces the
//! key/value prefixes of every layer once per forward pass.
//! `PrefixTuningLayer` sits inside self-attention and prepends them.

use crate::composition::AdapterCompositionBlock;
use crate::config::{AdapterConfig, PrefixTuningConfig};
use crate::core::AdapterResult;
use crate::model_architectures::parameters::{normal_var, ParamLinear};
use crate::model_architectures::traits::{groups, ForwardContext, InjectionPoint};
use crate::{composition_error, config_error};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Dropout;
use std::collections::BTreeMap;

/// Per-layer `(key, value)` prefixes, each `(batch, heads, prefix_length, head_dim)`
pub type LayerPrefixes = Vec<(Tensor, Tensor)>;

/// Prefixes of every active prefix adapter, by adapter name
#[derive(Debug, Clone, Default)]
pub struct PrefixStates {
    states: BTreeMap<String, LayerPrefixes>,
}

impl PrefixStates {
    pub fn get(&self, name: &str, layer_idx: usize) -> Option<&(Tensor, Tensor)> {
        self.states.get(name).and_then(|layers| layers.get(layer_idx))
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
enum PrefixSource {
    /// Prefixes learned directly
    Flat { control_trans: Var },
    /// Embedding reparameterized through a two-layer MLP
    Mlp {
        wte: Var,
        down: ParamLinear,
        up: ParamLinear,
    },
}

#[derive(Debug, Clone)]
struct PrefixGenerator {
    config: PrefixTuningConfig,
    source: PrefixSource,
    dropout: Dropout,
}

/// Model-level prefix generators
#[derive(Debug)]
pub struct PrefixTuningPool {
    num_layers: usize,
    num_heads: usize,
    hidden_size: usize,
    device: Device,
    dtype: DType,
    generators: BTreeMap<String, PrefixGenerator>,
}

impl PrefixTuningPool {
    pub fn new(num_layers: usize, num_heads: usize, hidden_size: usize, device: &Device, dtype: DType) -> Self {
        Self {
            num_layers,
            num_heads,
            hidden_size,
            device: device.clone(),
            dtype,
            generators: BTreeMap::new(),
        }
    }

    fn build_generator(&self, config: &PrefixTuningConfig) -> AdapterResult<PrefixGenerator> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(config_error!(
                "PrefixTuningPool",
                format!(
                    "hidden size {} is not divisible into {} heads",
                    self.hidden_size, self.num_heads
                )
            ));
        }
        let width = self.num_layers * 2 * self.hidden_size;
        let source = if config.flat {
            PrefixSource::Flat {
                control_trans: normal_var(config.prefix_length * width, 1.0, &self.device, self.dtype)?,
            }
        } else {
            PrefixSource::Mlp {
                wte: normal_var((config.prefix_length, self.hidden_size), 1.0, &self.device, self.dtype)?,
                down: ParamLinear::kaiming(self.hidden_size, config.bottleneck_size, true, &self.device, self.dtype)?,
                up: ParamLinear::kaiming(config.bottleneck_size, width, true, &self.device, self.dtype)?,
            }
        };
        Ok(PrefixGenerator {
            config: config.clone(),
            source,
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    /// Prefixes for the adapters of the active setup that live in this pool
    pub fn forward(&self, batch_size: usize, ctx: &ForwardContext) -> AdapterResult<PrefixStates> {
        let mut states = BTreeMap::new();
        let setup = match &ctx.adapter_setup {
            Some(setup) => setup,
            None => return Ok(PrefixStates { states }),
        };
        for name in setup.flatten() {
            if let Some(generator) = self.generators.get(&name) {
                let prefixes = self.generate(generator, batch_size, ctx.train)?;
                states.insert(name, prefixes);
            }
        }
        Ok(PrefixStates { states })
    }

    fn generate(&self, generator: &PrefixGenerator, batch_size: usize, train: bool) -> AdapterResult<LayerPrefixes> {
        let prefix_length = generator.config.prefix_length;
        let width = self.num_layers * 2 * self.hidden_size;
        let key_values = match &generator.source {
            PrefixSource::Flat { control_trans } => control_trans.as_tensor().reshape((prefix_length, width))?,
            PrefixSource::Mlp { wte, down, up } => {
                let hidden = generator
                    .config
                    .non_linearity
                    .apply(&down.forward(wte.as_tensor())?)?;
                up.forward(&hidden)?
            }
        };

        let head_dim = self.hidden_size / self.num_heads;
        let key_values = key_values
            .unsqueeze(0)?
            .broadcast_as((batch_size, prefix_length, width))?
            .reshape((batch_size, prefix_length, self.num_layers * 2, self.num_heads, head_dim))?;
        let key_values = generator.dropout.forward(&key_values, train)?;
        // (layers * 2, batch, heads, prefix_length, head_dim)
        let key_values = key_values.permute((2, 0, 3, 1, 4))?.contiguous()?;

        let mut layers = Vec::with_capacity(self.num_layers);
        for layer in 0..self.num_layers {
            let key = key_values.get(2 * layer)?;
            let value = key_values.get(2 * layer + 1)?;
            layers.push((key, value));
        }
        Ok(layers)
    }
}

impl InjectionPoint for PrefixTuningPool {
    fn location_key(&self) -> &str {
        "prefix_tuning"
    }

    fn layer_idx(&self) -> Option<usize> {
        None
    }

    fn parameter_group(&self) -> &'static str {
        groups::PREFIX_TUNINGS
    }

    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool> {
        let prefix_config = match config.as_prefix_tuning() {
            Some(c) => c,
            None => return Ok(false),
        };
        let generator = self.build_generator(prefix_config)?;
        self.generators.insert(name.to_string(), generator);
        Ok(true)
    }

    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        self.generators.remove(name);
        Ok(())
    }

    fn has_adapter(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    fn adapter_names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }

    fn adapter_parameters(&self, name: &str) -> Vec<(String, Var)> {
        match self.generators.get(name).map(|g| &g.source) {
            Some(PrefixSource::Flat { control_trans }) => {
                vec![("control_trans".to_string(), control_trans.clone())]
            }
            Some(PrefixSource::Mlp { wte, down, up }) => {
                let mut vars = vec![("wte.weight".to_string(), wte.clone())];
                vars.extend(down.named_vars("control_trans.0"));
                vars.extend(up.named_vars("control_trans.2"));
                vars
            }
            None => Vec::new(),
        }
    }
}

/// Self-attention hook prepending prefixes of the adapters hosted at this layer
#[derive(Debug, Default)]
pub struct PrefixTuningLayer {
    layer_idx: usize,
    prefix_lengths: BTreeMap<String, usize>,
}

impl PrefixTuningLayer {
    pub fn new(layer_idx: usize) -> Self {
        Self {
            layer_idx,
            prefix_lengths: BTreeMap::new(),
        }
    }

    /// Prepend prefixes to `key` and `value` `(batch, heads, seq, head_dim)`
    /// and widen the additive attention mask `(batch, 1, 1, seq)` to match
    pub fn forward(
        &self,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&Tensor>,
        prefix_states: &PrefixStates,
        ctx: &ForwardContext,
    ) -> AdapterResult<(Tensor, Tensor, Option<Tensor>)> {
        let passthrough = || Ok((key.clone(), value.clone(), attention_mask.cloned()));
        let setup = match ctx.setup_for_layer(Some(self.layer_idx)) {
            Some(setup) => setup,
            None => return passthrough(),
        };
        let names: Vec<String> = setup
            .flatten()
            .into_iter()
            .filter(|n| self.prefix_lengths.contains_key(n))
            .collect();
        if names.is_empty() {
            return passthrough();
        }
        if !is_plain_stack(setup) {
            return Err(composition_error!(
                format!("layer {} prefix_tuning", self.layer_idx),
                format!("prefix tuning supports single or stacked adapters, got {}", setup)
            ));
        }

        let batch = key.dim(0)?;
        let (mut key, mut value) = (key.clone(), value.clone());
        let mut mask = attention_mask.cloned();
        for name in &names {
            let (prefix_key, prefix_value) = match prefix_states.get(name, self.layer_idx) {
                Some(kv) => kv,
                None => continue,
            };
            let prefix_key = repeat_to_batch(prefix_key, batch)?;
            let prefix_value = repeat_to_batch(prefix_value, batch)?;
            let prefix_length = prefix_key.dim(2)?;
            key = Tensor::cat(&[&prefix_key, &key], 2)?;
            value = Tensor::cat(&[&prefix_value, &value], 2)?;
            if let Some(m) = mask {
                let (b, h, q, _) = m.dims4()?;
                let open = Tensor::zeros((b, h, q, prefix_length), m.dtype(), m.device())?;
                mask = Some(Tensor::cat(&[&open, &m], 3)?);
            }
        }
        Ok((key, value, mask))
    }
}

/// A single adapter or a Stack of single adapters
fn is_plain_stack(block: &AdapterCompositionBlock) -> bool {
    match block {
        AdapterCompositionBlock::Adapter(_) => true,
        AdapterCompositionBlock::Stack(children) => children
            .iter()
            .all(|c| matches!(c, AdapterCompositionBlock::Adapter(_))),
        _ => false,
    }
}

fn repeat_to_batch(t: &Tensor, batch: usize) -> AdapterResult<Tensor> {
    let current = t.dim(0)?;
    if current == batch {
        return Ok(t.clone());
    }
    if current == 0 || batch % current != 0 {
        return Err(composition_error!(
            "prefix_tuning",
            format!("prefix batch {} does not divide attention batch {}", current, batch)
        ));
    }
    Ok(t.repeat((batch / current, 1, 1, 1))?)
}

impl InjectionPoint for PrefixTuningLayer {
    fn location_key(&self) -> &str {
        "prefix_tuning"
    }

    fn layer_idx(&self) -> Option<usize> {
        Some(self.layer_idx)
    }

    fn parameter_group(&self) -> &'static str {
        groups::PREFIX_TUNINGS
    }

    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool> {
        match config.as_prefix_tuning() {
            Some(c) if config.applies_to_layer(Some(self.layer_idx)) => {
                self.prefix_lengths.insert(name.to_string(), c.prefix_length);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        self.prefix_lengths.remove(name);
        Ok(())
    }

    fn has_adapter(&self, name: &str) -> bool {
        self.prefix_lengths.contains_key(name)
    }

    fn adapter_names(&self) -> Vec<String> {
        self.prefix_lengths.keys().cloned().collect()
    }

    /// Parameters live in the pool
    fn adapter_parameters(&self, _name: &str) -> Vec<(String, Var)> {
        Vec::new()
    }
}
