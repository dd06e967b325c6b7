//! Activation functions selectable by name in adapter and head configs

use crate::config_error;
use crate::core::AdapterError;
use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named non-linearity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActivationFunction {
    Relu,
    /// Exact (erf based) GELU
    Gelu,
    /// Tanh approximation of GELU
    GeluNew,
    Swish,
    Tanh,
    Sigmoid,
    LeakyRelu,
    /// Identity
    Linear,
}

impl ActivationFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationFunction::Relu => "relu",
            ActivationFunction::Gelu => "gelu",
            ActivationFunction::GeluNew => "gelu_new",
            ActivationFunction::Swish => "swish",
            ActivationFunction::Tanh => "tanh",
            ActivationFunction::Sigmoid => "sigmoid",
            ActivationFunction::LeakyRelu => "leakyrelu",
            ActivationFunction::Linear => "linear",
        }
    }

    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ActivationFunction::Relu => x.relu(),
            ActivationFunction::Gelu => x.gelu_erf(),
            ActivationFunction::GeluNew => x.gelu(),
            ActivationFunction::Swish => x.silu(),
            ActivationFunction::Tanh => x.tanh(),
            ActivationFunction::Sigmoid => sigmoid(x),
            ActivationFunction::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.01),
            ActivationFunction::Linear => Ok(x.clone()),
        }
    }
}

/// Logistic sigmoid built from differentiable primitives
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

impl TryFrom<String> for ActivationFunction {
    type Error = AdapterError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.as_str().parse()
    }
}

impl std::str::FromStr for ActivationFunction {
    type Err = AdapterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(ActivationFunction::Relu),
            "gelu" => Ok(ActivationFunction::Gelu),
            "gelu_new" | "gelu_orig" => Ok(ActivationFunction::GeluNew),
            "swish" | "silu" => Ok(ActivationFunction::Swish),
            "tanh" => Ok(ActivationFunction::Tanh),
            "sigmoid" => Ok(ActivationFunction::Sigmoid),
            "leakyrelu" | "leaky_relu" => Ok(ActivationFunction::LeakyRelu),
            "linear" | "identity" => Ok(ActivationFunction::Linear),
            other => Err(config_error!(
                "activation lookup",
                format!("unknown activation function '{}'", other)
            )),
        }
    }
}

impl From<ActivationFunction> for String {
    fn from(value: ActivationFunction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
