//! Bottleneck adapter module
//!
//! Down projection, non-linearity and up projection with configurable layer
//! norms and residual placement. `pre_forward` and `post_forward` handle the
//! interplay with the host's own residual connection and layer norm.

use super::phm::PHMLayer;
use crate::config::{AdapterFusionConfig, BottleneckConfig, BottleneckInit};
use crate::core::AdapterResult;
use crate::model_architectures::parameters::{LayerNorm, ParamLinear};
use candle_core::{DType, Device, Module, Result, Tensor, Var};

#[derive(Debug, Clone)]
enum Projection {
    Dense(ParamLinear),
    Phm(PHMLayer),
}

impl Projection {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Projection::Dense(l) => l.forward(x),
            Projection::Phm(p) => p.forward(x),
        }
    }

    fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        match self {
            Projection::Dense(l) => l.named_vars(prefix),
            Projection::Phm(p) => p.named_vars(prefix),
        }
    }
}

/// Output of one adapter: final hidden states, bottleneck activations and
/// the up projection before residual and norm
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    pub hidden_states: Tensor,
    pub down: Tensor,
    pub up: Tensor,
}

#[derive(Debug, Clone)]
pub struct BottleneckAdapter {
    config: BottleneckConfig,
    norm_before: Option<LayerNorm>,
    down: Projection,
    up: Projection,
    norm_after: Option<LayerNorm>,
    down_sample: usize,
}

impl BottleneckAdapter {
    pub fn new(
        input_size: usize,
        down_sample: usize,
        config: &BottleneckConfig,
        layer_norm_eps: f64,
        device: &Device,
        dtype: DType,
    ) -> AdapterResult<Self> {
        let down_sample = down_sample.max(1);
        let norm_before = if config.ln_before {
            Some(LayerNorm::trainable(input_size, layer_norm_eps, device, dtype)?)
        } else {
            None
        };
        let norm_after = if config.ln_after {
            Some(LayerNorm::trainable(input_size, layer_norm_eps, device, dtype)?)
        } else {
            None
        };

        let (down, up) = if config.phm_layer {
            (
                Projection::Phm(PHMLayer::new(input_size, down_sample, config, device, dtype)?),
                Projection::Phm(PHMLayer::new(down_sample, input_size, config, device, dtype)?),
            )
        } else {
            match config.init_weights {
                BottleneckInit::Bert => (
                    Projection::Dense(ParamLinear::normal(input_size, down_sample, 0.02, true, device, dtype)?),
                    Projection::Dense(ParamLinear::normal(down_sample, input_size, 0.02, true, device, dtype)?),
                ),
                BottleneckInit::MamAdapter => (
                    Projection::Dense(ParamLinear::kaiming(input_size, down_sample, true, device, dtype)?),
                    Projection::Dense(ParamLinear::zeros(down_sample, input_size, true, device, dtype)?),
                ),
            }
        };

        Ok(Self {
            config: config.clone(),
            norm_before,
            down,
            up,
            norm_after,
            down_sample,
        })
    }

    pub fn config(&self) -> &BottleneckConfig {
        &self.config
    }

    pub fn down_sample(&self) -> usize {
        self.down_sample
    }

    /// Residual selection and original layer norm before the adapter.
    /// Returns `(hidden_states, query, residual)`.
    pub fn pre_forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        layer_norm: Option<&LayerNorm>,
        fusion_config: Option<&AdapterFusionConfig>,
    ) -> Result<(Tensor, Option<Tensor>, Tensor)> {
        let mut query = None;
        let mut residual = None;
        if self.config.residual_before_ln {
            residual = Some(hidden_states.clone());
        }
        if let Some(fusion) = fusion_config {
            if fusion.query_before_ln {
                query = Some(hidden_states.clone());
            }
        }

        let hidden_states = if self.config.original_ln_before {
            let summed = hidden_states.add(input_tensor)?;
            match layer_norm {
                Some(ln) => ln.forward(&summed)?,
                None => summed,
            }
        } else {
            hidden_states.clone()
        };

        let residual = match residual {
            Some(r) => r,
            None => hidden_states.clone(),
        };
        if let Some(fusion) = fusion_config {
            if !fusion.query_before_ln {
                query = Some(hidden_states.clone());
            }
        }
        Ok((hidden_states, query, residual))
    }

    pub fn forward(&self, x: &Tensor, residual_input: &Tensor) -> Result<AdapterOutput> {
        let normed = match &self.norm_before {
            Some(ln) => ln.forward(x)?,
            None => x.clone(),
        };
        let down = self.config.non_linearity.apply(&self.down.forward(&normed)?)?;
        let up = self.up.forward(&down)?;

        let mut output = up.clone();
        if self.config.adapter_residual_before_ln {
            output = output.add(residual_input)?;
        }
        if let Some(ln) = &self.norm_after {
            output = ln.forward(&output)?;
        }
        if !self.config.adapter_residual_before_ln {
            output = output.add(residual_input)?;
        }
        Ok(AdapterOutput {
            hidden_states: output,
            down,
            up,
        })
    }

    /// Original layer norm after the adapter
    pub fn post_forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        layer_norm: Option<&LayerNorm>,
    ) -> Result<Tensor> {
        if !self.config.original_ln_after {
            return Ok(hidden_states.clone());
        }
        let summed = hidden_states.add(input_tensor)?;
        match layer_norm {
            Some(ln) => ln.forward(&summed),
            None => Ok(summed),
        }
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        if let Some(ln) = &self.norm_before {
            vars.extend(ln.named_vars("adapter_norm_before"));
        }
        vars.extend(self.down.named_vars("adapter_down"));
        vars.extend(self.up.named_vars("adapter_up"));
        if let Some(ln) = &self.norm_after {
            vars.extend(ln.named_vars("adapter_norm_after"));
        }
        vars
    }
}
