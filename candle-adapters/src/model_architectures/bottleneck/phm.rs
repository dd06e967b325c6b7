//! Parameterized hypercomplex multiplication (PHM) projection
//!
//! The weight `H (in, out)` is a sum of Kronecker products
//! `Σᵢ Aᵢ ⊗ Wᵢ` of small `(n, n)` rule matrices and `(in/n, out/n)` blocks,
//! where `n` is `phm_dim`. Both factors can be low-rank factorized.

use crate::config::BottleneckConfig;
use crate::config_error;
use crate::core::AdapterResult;
use crate::model_architectures::parameters::{normal_var, uniform_var, zeros_var};
use candle_core::{DType, Device, Result, Tensor, Var};

#[derive(Debug, Clone)]
enum Factor {
    Full(Var),
    Factorized { left: Var, right: Var },
}

impl Factor {
    fn tensor(&self) -> Result<Tensor> {
        match self {
            Factor::Full(v) => Ok(v.as_tensor().clone()),
            Factor::Factorized { left, right } => left.as_tensor().matmul(right.as_tensor()),
        }
    }

    fn named_vars(&self, name: &str, prefix: &str) -> Vec<(String, Var)> {
        match self {
            Factor::Full(v) => vec![(format!("{}.{}", prefix, name), v.clone())],
            Factor::Factorized { left, right } => vec![
                (format!("{}.{}_left", prefix, name), left.clone()),
                (format!("{}.{}_right", prefix, name), right.clone()),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PHMLayer {
    phm_dim: usize,
    in_features: usize,
    out_features: usize,
    phm_rule: Factor,
    weight: Factor,
    bias: Var,
    learn_phm: bool,
}

fn init_block(shape: (usize, usize, usize), config: &BottleneckConfig, device: &Device, dtype: DType) -> Result<Var> {
    let (_, fan_in, fan_out) = shape;
    match config.hypercomplex_nonlinearity.as_str() {
        "glorot-normal" => normal_var(shape, (2.0 / (fan_in + fan_out) as f64).sqrt(), device, dtype),
        "normal" => normal_var(shape, config.phm_init_range, device, dtype),
        _ => uniform_var(shape, (6.0 / (fan_in + fan_out) as f64).sqrt(), device, dtype),
    }
}

fn init_rule(shape: (usize, usize, usize), config: &BottleneckConfig, device: &Device, dtype: DType) -> Result<Var> {
    match config.phm_c_init.as_str() {
        "uniform" => uniform_var(shape, 1e-2, device, dtype),
        _ => normal_var(shape, 1e-2, device, dtype),
    }
}

impl PHMLayer {
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &BottleneckConfig,
        device: &Device,
        dtype: DType,
    ) -> AdapterResult<Self> {
        let n = config.phm_dim;
        if n == 0 || in_features % n != 0 || out_features % n != 0 {
            return Err(config_error!(
                "PHMLayer::new",
                format!(
                    "phm_dim {} must divide both in_features {} and out_features {}",
                    n, in_features, out_features
                )
            ));
        }
        let (in_axis, out_axis) = (in_features / n, out_features / n);
        let rank = config.phm_rank;

        let phm_rule = if config.factorized_phm_rule {
            Factor::Factorized {
                left: init_rule((n, n, 1), config, device, dtype)?,
                right: init_rule((n, 1, n), config, device, dtype)?,
            }
        } else {
            Factor::Full(init_rule((n, n, n), config, device, dtype)?)
        };
        let weight = if config.factorized_phm_w {
            Factor::Factorized {
                left: init_block((n, in_axis, rank), config, device, dtype)?,
                right: init_block((n, rank, out_axis), config, device, dtype)?,
            }
        } else {
            Factor::Full(init_block((n, in_axis, out_axis), config, device, dtype)?)
        };

        Ok(Self {
            phm_dim: n,
            in_features,
            out_features,
            phm_rule,
            weight,
            bias: zeros_var(out_features, device, dtype)?,
            learn_phm: config.learn_phm,
        })
    }

    /// Assembled `(in, out)` weight
    pub fn hypercomplex_weight(&self) -> Result<Tensor> {
        let rule = self.phm_rule.tensor()?;
        let rule = if self.learn_phm { rule } else { rule.detach() };
        kronecker_sum(&rule, &self.weight.tensor()?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_matmul(&self.hypercomplex_weight()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = self.phm_rule.named_vars("phm_rule", prefix);
        vars.extend(self.weight.named_vars("W", prefix));
        vars.push((format!("{}.b", prefix), self.bias.clone()));
        vars
    }

    pub fn phm_dim(&self) -> usize {
        self.phm_dim
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.in_features, self.out_features)
    }
}

/// `Σₖ a[k] ⊗ b[k]` for `a (k, p, p)` and `b (k, m, n)`, giving `(p·m, p·n)`
pub fn kronecker_sum(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (k, p, q) = a.dims3()?;
    let (_, m, n) = b.dims3()?;
    let a = a.reshape((k, p, 1, q, 1))?;
    let b = b.reshape((k, 1, m, 1, n))?;
    a.broadcast_mul(&b)?.reshape((k, p * m, q * n))?.sum(0)
}
