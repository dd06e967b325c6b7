//! Trainable parameter building blocks
//!
//! Adapter parameters are `Var`s so that gradients reach them; base model
//! weights stay plain tensors. Layer norm is written out from primitive ops
//! so that gradients can pass through frozen norms too.

use candle_core::{DType, Device, Module, Result, Shape, Tensor, Var, D};
use candle_nn::Linear;

/// Var drawn from N(0, std)
pub fn normal_var<S: Into<Shape>>(shape: S, std: f64, device: &Device, dtype: DType) -> Result<Var> {
    let t = Tensor::randn(0f32, std as f32, shape, device)?.to_dtype(dtype)?;
    Var::from_tensor(&t)
}

/// Var drawn from U(-bound, bound)
pub fn uniform_var<S: Into<Shape>>(shape: S, bound: f64, device: &Device, dtype: DType) -> Result<Var> {
    let t = Tensor::rand(-bound as f32, bound as f32, shape, device)?.to_dtype(dtype)?;
    Var::from_tensor(&t)
}

/// Kaiming-uniform with `a = sqrt(5)`, the default of dense layers: bound `1/sqrt(fan_in)`
pub fn kaiming_uniform_var(out_dim: usize, in_dim: usize, device: &Device, dtype: DType) -> Result<Var> {
    uniform_var((out_dim, in_dim), 1.0 / (in_dim.max(1) as f64).sqrt(), device, dtype)
}

/// Glorot-uniform: bound `sqrt(6 / (fan_in + fan_out))`
pub fn glorot_uniform_var(out_dim: usize, in_dim: usize, device: &Device, dtype: DType) -> Result<Var> {
    uniform_var((out_dim, in_dim), (6.0 / (in_dim + out_dim).max(1) as f64).sqrt(), device, dtype)
}

pub fn zeros_var<S: Into<Shape>>(shape: S, device: &Device, dtype: DType) -> Result<Var> {
    Var::zeros(shape, dtype, device)
}

pub fn ones_var<S: Into<Shape>>(shape: S, device: &Device, dtype: DType) -> Result<Var> {
    Var::ones(shape, dtype, device)
}

/// Dense layer backed by `Var`s
#[derive(Debug, Clone)]
pub struct ParamLinear {
    weight: Var,
    bias: Option<Var>,
    linear: Linear,
}

impl ParamLinear {
    pub fn new(weight: Var, bias: Option<Var>) -> Self {
        let linear = Linear::new(
            weight.as_tensor().clone(),
            bias.as_ref().map(|b| b.as_tensor().clone()),
        );
        Self {
            weight,
            bias,
            linear,
        }
    }

    /// N(0, std) weight, zero bias
    pub fn normal(in_dim: usize, out_dim: usize, std: f64, bias: bool, device: &Device, dtype: DType) -> Result<Self> {
        let weight = normal_var((out_dim, in_dim), std, device, dtype)?;
        let bias = if bias { Some(zeros_var(out_dim, device, dtype)?) } else { None };
        Ok(Self::new(weight, bias))
    }

    /// Dense default init: kaiming-uniform weight, uniform bias
    pub fn kaiming(in_dim: usize, out_dim: usize, bias: bool, device: &Device, dtype: DType) -> Result<Self> {
        let weight = kaiming_uniform_var(out_dim, in_dim, device, dtype)?;
        let bias = if bias {
            Some(uniform_var(out_dim, 1.0 / (in_dim.max(1) as f64).sqrt(), device, dtype)?)
        } else {
            None
        };
        Ok(Self::new(weight, bias))
    }

    pub fn zeros(in_dim: usize, out_dim: usize, bias: bool, device: &Device, dtype: DType) -> Result<Self> {
        let weight = zeros_var((out_dim, in_dim), device, dtype)?;
        let bias = if bias { Some(zeros_var(out_dim, device, dtype)?) } else { None };
        Ok(Self::new(weight, bias))
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// `(prefix.weight, var)` and `(prefix.bias, var)` pairs
    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(bias) = &self.bias {
            vars.push((format!("{}.bias", prefix), bias.clone()));
        }
        vars
    }
}

impl Module for ParamLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(xs)
    }
}

/// Layer normalization over the last dimension
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    vars: Option<(Var, Var)>,
}

impl LayerNorm {
    /// Norm with fixed weights, for frozen base layers
    pub fn frozen(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self {
            weight,
            bias,
            eps,
            vars: None,
        }
    }

    /// Trainable norm initialized to the identity transform
    pub fn trainable(dim: usize, eps: f64, device: &Device, dtype: DType) -> Result<Self> {
        let weight = ones_var(dim, device, dtype)?;
        let bias = zeros_var(dim, device, dtype)?;
        Ok(Self {
            weight: weight.as_tensor().clone(),
            bias: bias.as_tensor().clone(),
            eps,
            vars: Some((weight, bias)),
        })
    }

    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        match &self.vars {
            Some((w, b)) => vec![
                (format!("{}.weight", prefix), w.clone()),
                (format!("{}.bias", prefix), b.clone()),
            ],
            None => Vec::new(),
        }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}
