//! Invertible adapters on the embedding output
//!
//! Coupling blocks split the hidden dimension in two halves and transform
//! each half conditioned on the other, so the mapping can be undone exactly
//! before a language-modeling head.

use crate::config::{AdapterConfig, InvertibleAdapterKind};
use crate::core::AdapterResult;
use crate::model_architectures::activation::ActivationFunction;
use crate::model_architectures::parameters::ParamLinear;
use crate::model_architectures::traits::{groups, ForwardContext, InjectionPoint};
use crate::config_error;
use candle_core::{DType, Device, Module, Result, Tensor, Var, D};
use std::collections::BTreeMap;

const DEFAULT_INV_REDUCTION_FACTOR: f64 = 2.0;
/// Soft clamp of the Glow log-scale
const GLOW_CLAMP: f64 = 5.0;

/// Two-layer MLP used inside a coupling block
#[derive(Debug, Clone)]
pub struct CouplingNet {
    down: ParamLinear,
    up: ParamLinear,
    activation: ActivationFunction,
}

impl CouplingNet {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        activation: ActivationFunction,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Ok(Self {
            down: ParamLinear::kaiming(in_dim, hidden_dim.max(1), true, device, dtype)?,
            up: ParamLinear::kaiming(hidden_dim.max(1), out_dim, true, device, dtype)?,
            activation,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.up.forward(&self.activation.apply(&self.down.forward(x)?)?)
    }

    /// Keys `<prefix>.0.*` and `<prefix>.2.*` mirror a Linear, activation, Linear stack
    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = self.down.named_vars(&format!("{}.0", prefix));
        vars.extend(self.up.named_vars(&format!("{}.2", prefix)));
        vars
    }
}

/// One invertible coupling block over the hidden dimension
#[derive(Debug, Clone)]
pub enum CouplingBlock {
    /// Additive coupling: `y1 = x1 + F(x2)`, `y2 = x2 + G(y1)`
    Nice {
        split: usize,
        f: CouplingNet,
        g: CouplingNet,
    },
    /// Affine coupling with soft-clamped scales
    Glow {
        split: usize,
        s1: CouplingNet,
        s2: CouplingNet,
    },
}

impl CouplingBlock {
    pub fn new(
        kind: InvertibleAdapterKind,
        hidden_size: usize,
        reduction_factor: f64,
        activation: ActivationFunction,
        device: &Device,
        dtype: DType,
    ) -> AdapterResult<Self> {
        if hidden_size < 2 {
            return Err(config_error!(
                "invertible adapter",
                format!("hidden size {} cannot be split in two halves", hidden_size)
            ));
        }
        let len1 = hidden_size / 2;
        let len2 = hidden_size - len1;
        let reduce = |n: usize| (n as f64 / reduction_factor) as usize;
        Ok(match kind {
            InvertibleAdapterKind::Nice => CouplingBlock::Nice {
                split: len1,
                f: CouplingNet::new(len2, reduce(len1), len1, activation, device, dtype)?,
                g: CouplingNet::new(len1, reduce(len2), len2, activation, device, dtype)?,
            },
            InvertibleAdapterKind::Glow => CouplingBlock::Glow {
                split: len1,
                s1: CouplingNet::new(len1, reduce(len1), 2 * len2, activation, device, dtype)?,
                s2: CouplingNet::new(len2, reduce(len2), 2 * len1, activation, device, dtype)?,
            },
        })
    }

    fn halves(x: &Tensor, split: usize) -> Result<(Tensor, Tensor)> {
        let width = x.dim(D::Minus1)?;
        Ok((x.narrow(D::Minus1, 0, split)?, x.narrow(D::Minus1, split, width - split)?))
    }

    /// Split the Glow conditioner output into `(log_scale, shift)`
    fn scale_shift(r: &Tensor, len: usize) -> Result<(Tensor, Tensor)> {
        let log_scale = r.narrow(D::Minus1, 0, len)?;
        let shift = r.narrow(D::Minus1, len, len)?;
        // clamp * tanh(s / clamp) keeps exp() bounded
        let log_scale = log_scale.affine(1.0 / GLOW_CLAMP, 0.0)?.tanh()?.affine(GLOW_CLAMP, 0.0)?;
        Ok((log_scale, shift))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            CouplingBlock::Nice { split, f, g } => {
                let (x1, x2) = Self::halves(x, *split)?;
                let y1 = x1.add(&f.forward(&x2)?)?;
                let y2 = x2.add(&g.forward(&y1)?)?;
                Tensor::cat(&[y1, y2], D::Minus1)
            }
            CouplingBlock::Glow { split, s1, s2 } => {
                let (x1, x2) = Self::halves(x, *split)?;
                let len2 = x2.dim(D::Minus1)?;
                let (log_a, shift_a) = Self::scale_shift(&s2.forward(&x2)?, *split)?;
                let y1 = log_a.exp()?.mul(&x1)?.add(&shift_a)?;
                let (log_b, shift_b) = Self::scale_shift(&s1.forward(&y1)?, len2)?;
                let y2 = log_b.exp()?.mul(&x2)?.add(&shift_b)?;
                Tensor::cat(&[y1, y2], D::Minus1)
            }
        }
    }

    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        match self {
            CouplingBlock::Nice { split, f, g } => {
                let (y1, y2) = Self::halves(y, *split)?;
                let x2 = y2.sub(&g.forward(&y1)?)?;
                let x1 = y1.sub(&f.forward(&x2)?)?;
                Tensor::cat(&[x1, x2], D::Minus1)
            }
            CouplingBlock::Glow { split, s1, s2 } => {
                let (y1, y2) = Self::halves(y, *split)?;
                let len2 = y2.dim(D::Minus1)?;
                let (log_b, shift_b) = Self::scale_shift(&s1.forward(&y1)?, len2)?;
                let x2 = y2.sub(&shift_b)?.mul(&log_b.neg()?.exp()?)?;
                let (log_a, shift_a) = Self::scale_shift(&s2.forward(&x2)?, *split)?;
                let x1 = y1.sub(&shift_a)?.mul(&log_a.neg()?.exp()?)?;
                Tensor::cat(&[x1, x2], D::Minus1)
            }
        }
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        match self {
            CouplingBlock::Nice { f, g, .. } => {
                let mut vars = f.named_vars("F");
                vars.extend(g.named_vars("G"));
                vars
            }
            CouplingBlock::Glow { s1, s2, .. } => {
                let mut vars = s1.named_vars("s1");
                vars.extend(s2.named_vars("s2"));
                vars
            }
        }
    }
}

/// Model-level point holding one coupling block per adapter
#[derive(Debug)]
pub struct InvertibleAdaptersLayer {
    hidden_size: usize,
    device: Device,
    dtype: DType,
    blocks: BTreeMap<String, CouplingBlock>,
}

impl InvertibleAdaptersLayer {
    pub fn new(hidden_size: usize, device: &Device, dtype: DType) -> Self {
        Self {
            hidden_size,
            device: device.clone(),
            dtype,
            blocks: BTreeMap::new(),
        }
    }

    pub fn block(&self, name: &str) -> Option<&CouplingBlock> {
        self.blocks.get(name)
    }

    /// Block of the first adapter in the active setup, if it has one
    fn active_block(&self, ctx: &ForwardContext) -> Option<&CouplingBlock> {
        ctx.adapter_setup
            .as_ref()
            .and_then(|setup| setup.first())
            .and_then(|first| self.blocks.get(first))
    }

    pub fn forward(&self, hidden_states: &Tensor, ctx: &ForwardContext) -> AdapterResult<Tensor> {
        match self.active_block(ctx) {
            Some(block) => Ok(block.forward(hidden_states)?),
            None => Ok(hidden_states.clone()),
        }
    }

    pub fn inverse(&self, hidden_states: &Tensor, ctx: &ForwardContext) -> AdapterResult<Tensor> {
        match self.active_block(ctx) {
            Some(block) => Ok(block.inverse(hidden_states)?),
            None => Ok(hidden_states.clone()),
        }
    }
}

impl InjectionPoint for InvertibleAdaptersLayer {
    fn location_key(&self) -> &str {
        "invertible"
    }

    fn layer_idx(&self) -> Option<usize> {
        None
    }

    fn parameter_group(&self) -> &'static str {
        groups::INVERTIBLE_ADAPTERS
    }

    fn add_adapter(&mut self, name: &str, config: &AdapterConfig) -> AdapterResult<bool> {
        let bottleneck = match config.as_bottleneck() {
            Some(c) => c,
            None => return Ok(false),
        };
        let kind = match bottleneck.inv_adapter {
            Some(kind) => kind,
            None => return Ok(false),
        };
        let block = CouplingBlock::new(
            kind,
            self.hidden_size,
            bottleneck
                .inv_adapter_reduction_factor
                .unwrap_or(DEFAULT_INV_REDUCTION_FACTOR),
            bottleneck.non_linearity,
            &self.device,
            self.dtype,
        )?;
        self.blocks.insert(name.to_string(), block);
        Ok(true)
    }

    fn delete_adapter(&mut self, name: &str) -> AdapterResult<()> {
        self.blocks.remove(name);
        Ok(())
    }

    fn has_adapter(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    fn adapter_names(&self) -> Vec<String> {
        self.blocks.keys().cloned().collect()
    }

    fn adapter_parameters(&self, name: &str) -> Vec<(String, Var)> {
        self.blocks
            .get(name)
            .map(|b| b.named_vars())
            .unwrap_or_default()
    }
}
