//! LoRA adapter core implementation
//!
//! One `LoRAAdapter` holds the low-rank pair `A (r·g, in)`, `B (out, r)` of a
//! single adapter at a single injection point, or the per-output vector of an
//! (IA)³ adapter. `g` is the number of attention matrices the adapter targets
//! inside a grouped q/k/v projection, 1 everywhere else.

use crate::config::{CompositionMode, LoRAConfig, LoRAInit};
use crate::config_error;
use crate::core::AdapterResult;
use crate::model_architectures::parameters::{kaiming_uniform_var, normal_var, ones_var, zeros_var};
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::Dropout;

/// Core LoRA adapter implementation
#[derive(Debug)]
pub struct LoRAAdapter {
    /// Low-rank matrix A `(r·groups, in)`, or the `(out, 1)` vector without decomposition
    lora_a: Var,
    /// Low-rank matrix B `(out, r)`; absent without decomposition
    lora_b: Option<Var>,
    dropout: Dropout,
    /// Scaling factor (alpha / r)
    scaling: f64,
    groups: usize,
    out_per_group: usize,
    config: LoRAConfig,
}

impl LoRAAdapter {
    /// Create a new adapter over `groups` output blocks of `out_per_group` features
    pub fn new(
        in_dim: usize,
        out_per_group: usize,
        groups: usize,
        config: &LoRAConfig,
        device: &Device,
        dtype: DType,
    ) -> AdapterResult<Self> {
        config.validate()?;
        if groups == 0 {
            return Err(config_error!("LoRAAdapter::new", "adapter targets no output group"));
        }
        let r = config.r;
        let out_dim = out_per_group * groups;

        let (lora_a, lora_b) = if config.no_decomposition {
            let vector = match config.init_weights {
                LoRAInit::Ia3 => ones_var((out_dim, 1), device, dtype)?,
                LoRAInit::Bert => normal_var((out_dim, 1), 0.02, device, dtype)?,
                LoRAInit::Lora => kaiming_uniform_var(out_dim, 1, device, dtype)?,
            };
            (vector, None)
        } else {
            match config.init_weights {
                LoRAInit::Lora => (
                    kaiming_uniform_var(r * groups, in_dim, device, dtype)?,
                    Some(zeros_var((out_dim, r), device, dtype)?),
                ),
                LoRAInit::Bert => (
                    normal_var((r * groups, in_dim), 0.02, device, dtype)?,
                    Some(normal_var((out_dim, r), 0.02, device, dtype)?),
                ),
                LoRAInit::Ia3 => (
                    ones_var((r * groups, in_dim), device, dtype)?,
                    Some(ones_var((out_dim, r), device, dtype)?),
                ),
            }
        };

        Ok(Self {
            lora_a,
            lora_b,
            dropout: Dropout::new(config.dropout as f32),
            scaling: config.scaling(),
            groups,
            out_per_group,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &LoRAConfig {
        &self.config
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn composition_mode(&self) -> CompositionMode {
        self.config.composition_mode
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn out_per_group(&self) -> usize {
        self.out_per_group
    }

    pub fn lora_a(&self) -> &Var {
        &self.lora_a
    }

    pub fn lora_b(&self) -> Option<&Var> {
        self.lora_b.as_ref()
    }

    /// Per-group update of the projection output, each `(…, out_per_group)`.
    /// Without decomposition each group is a `(out_per_group,)` vector.
    pub fn delta_output_groups(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let r = self.config.r;
        match &self.lora_b {
            None => {
                let vector = self.lora_a.as_tensor().flatten_all()?;
                (0..self.groups)
                    .map(|g| vector.narrow(0, g * self.out_per_group, self.out_per_group))
                    .collect()
            }
            Some(lora_b) => {
                let x = self.dropout.forward(x, train)?;
                (0..self.groups)
                    .map(|g| {
                        let a = self.lora_a.as_tensor().narrow(0, g * r, r)?;
                        let b = lora_b.as_tensor().narrow(0, g * self.out_per_group, self.out_per_group)?;
                        let after_a = x.broadcast_matmul(&a.t()?)?;
                        after_a.broadcast_matmul(&b.t()?)
                    })
                    .collect()
            }
        }
    }

    /// Per-group weight update, each `(out_per_group, in)` or `(out_per_group, 1)`
    pub fn delta_weight_groups(&self) -> Result<Vec<Tensor>> {
        let r = self.config.r;
        match &self.lora_b {
            None => (0..self.groups)
                .map(|g| {
                    self.lora_a
                        .as_tensor()
                        .narrow(0, g * self.out_per_group, self.out_per_group)
                })
                .collect(),
            Some(lora_b) => (0..self.groups)
                .map(|g| {
                    let a = self.lora_a.as_tensor().narrow(0, g * r, r)?;
                    let b = lora_b.as_tensor().narrow(0, g * self.out_per_group, self.out_per_group)?;
                    b.matmul(&a)
                })
                .collect(),
        }
    }

    /// Compose `weights` with `added`: `w + s·a` or `w ⊙ (s·a)`
    pub fn com(&self, weights: &Tensor, added: &Tensor) -> Result<Tensor> {
        let scaled = added.affine(self.scaling, 0.0)?;
        match self.config.composition_mode {
            CompositionMode::Add => weights.broadcast_add(&scaled),
            CompositionMode::Scale => weights.broadcast_mul(&scaled),
        }
    }

    /// Exact inverse of [`Self::com`]
    pub fn com_inv(&self, weights: &Tensor, added: &Tensor) -> Result<Tensor> {
        let scaled = added.affine(self.scaling, 0.0)?;
        match self.config.composition_mode {
            CompositionMode::Add => weights.broadcast_sub(&scaled),
            CompositionMode::Scale => weights.broadcast_div(&scaled),
        }
    }

    /// Parameters keyed `lora_A` / `lora_B`
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = vec![("lora_A".to_string(), self.lora_a.clone())];
        if let Some(b) = &self.lora_b {
            vars.push(("lora_B".to_string(), b.clone()));
        }
        vars
    }

    pub fn parameter_count(&self) -> usize {
        self.lora_a.as_tensor().elem_count()
            + self.lora_b.as_ref().map(|b| b.as_tensor().elem_count()).unwrap_or(0)
    }
}
