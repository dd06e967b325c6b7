//! Adapter fusion layer
//!
//! Attention across the outputs of several adapters at one injection point.
//! Each position attends over the `n` adapter outputs with a learned query
//! (from the residual stream) and learned keys; values are the adapter
//! outputs, optionally projected.

use crate::config::AdapterFusionConfig;
use crate::core::AdapterResult;
use crate::model_architectures::parameters::{normal_var, ParamLinear};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::Dropout;
use std::cell::Cell;

const INITIAL_TEMPERATURE: f64 = 50.0;
const REGULARIZATION_WEIGHT: f64 = 0.01;

#[derive(Debug)]
pub struct BertFusion {
    config: AdapterFusionConfig,
    query: Option<ParamLinear>,
    key: Option<ParamLinear>,
    value: Option<ParamLinear>,
    dropout: Dropout,
    temperature: Cell<f64>,
    reduction: f64,
    hidden_size: usize,
}

impl BertFusion {
    pub fn new(
        hidden_size: usize,
        config: &AdapterFusionConfig,
        attention_probs_dropout_prob: f64,
        device: &Device,
        dtype: DType,
    ) -> AdapterResult<Self> {
        let query = if config.query {
            Some(ParamLinear::normal(hidden_size, hidden_size, 0.02, true, device, dtype)?)
        } else {
            None
        };
        let key = if config.key {
            Some(ParamLinear::normal(hidden_size, hidden_size, 0.02, true, device, dtype)?)
        } else {
            None
        };
        let value = if config.value {
            let weight = if config.value_initialized.is_enabled() {
                Var::from_tensor(&near_identity(hidden_size, device, dtype)?)?
            } else {
                normal_var((hidden_size, hidden_size), 0.02, device, dtype)?
            };
            Some(ParamLinear::new(weight, None))
        } else {
            None
        };

        let temperature = if config.temperature { INITIAL_TEMPERATURE } else { 1.0 };

        Ok(Self {
            config: config.clone(),
            query,
            key,
            value,
            dropout: Dropout::new(attention_probs_dropout_prob as f32),
            temperature: Cell::new(temperature),
            reduction: temperature / 1000.0,
            hidden_size,
        })
    }

    pub fn config(&self) -> &AdapterFusionConfig {
        &self.config
    }

    /// Current softmax temperature
    pub fn temperature(&self) -> f64 {
        self.temperature.get()
    }

    /// Fuse adapter outputs.
    ///
    /// Shapes: `query (b, s, d)`, `key (b, s, n, d)`, `value (b, s, n, d)`,
    /// `residual (b, s, d)`. Returns `(b, s, d)`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        residual: &Tensor,
        train: bool,
    ) -> AdapterResult<Tensor> {
        let value = if self.config.residual_before {
            value.broadcast_add(&residual.unsqueeze(2)?)?
        } else {
            value.clone()
        };

        let query_layer = match &self.query {
            Some(q) => q.forward(query)?,
            None => query.clone(),
        };
        let key_layer = match &self.key {
            Some(k) => k.forward(key)?,
            None => key.clone(),
        };
        let value_layer = match (&self.value, self.config.value_before_softmax) {
            (Some(v), true) => v.forward(&value)?,
            _ => value,
        };

        // (b, s, 1, d) x (b, s, d, n) -> (b, s, n)
        let scores = query_layer
            .unsqueeze(2)?
            .contiguous()?
            .matmul(&key_layer.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
            .squeeze(2)?;
        let scores = self.dropout.forward(&scores, train)?;

        let t = self.temperature.get();
        let probs = candle_nn::ops::softmax(&scores.affine(1.0 / t, 0.0)?, D::Minus1)?;
        self.temperature.set((t - self.reduction).max(1.0));

        // (b, s, 1, n) x (b, s, n, d) -> (b, s, d)
        let mut context = probs
            .unsqueeze(2)?
            .contiguous()?
            .matmul(&value_layer.contiguous()?)?
            .squeeze(2)?;

        if let (Some(v), false) = (&self.value, self.config.value_before_softmax) {
            context = v.forward(&context)?;
        }
        if !self.config.residual_before {
            context = context.add(residual)?;
        }
        Ok(context)
    }

    /// `0.01 · ‖I − V‖²` over the value projection, when regularization is on
    pub fn regularization_loss(&self) -> AdapterResult<Option<Tensor>> {
        match (&self.value, self.config.regularization) {
            (Some(value), true) => {
                let weight = value.weight().as_tensor();
                let target = identity(self.hidden_size, weight.device(), weight.dtype())?;
                let loss = target
                    .sub(weight)?
                    .sqr()?
                    .sum_all()?
                    .affine(REGULARIZATION_WEIGHT, 0.0)?;
                Ok(Some(loss))
            }
            _ => Ok(None),
        }
    }

    /// Parameters keyed `query.weight`, `key.bias`, `value.weight`, ...
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        if let Some(q) = &self.query {
            vars.extend(q.named_vars("query"));
        }
        if let Some(k) = &self.key {
            vars.extend(k.named_vars("key"));
        }
        if let Some(v) = &self.value {
            vars.extend(v.named_vars("value"));
        }
        vars
    }
}

/// Summed regularization loss of several fusion layers, `None` when none regularize
pub fn total_regularization_loss<'a, I>(fusions: I) -> AdapterResult<Option<Tensor>>
where
    I: IntoIterator<Item = &'a BertFusion>,
{
    let mut total: Option<Tensor> = None;
    for fusion in fusions {
        if let Some(loss) = fusion.regularization_loss()? {
            total = Some(match total {
                Some(t) => t.add(&loss)?,
                None => loss,
            });
        }
    }
    Ok(total)
}

/// `(n, n)` identity matrix
pub fn identity(n: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}

/// Identity with 1e-6 off the diagonal
fn near_identity(n: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 1e-6 })
        .collect();
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}
