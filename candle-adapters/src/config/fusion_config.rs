//! Fusion layer configuration

use serde::{Deserialize, Serialize};

/// `value_initialized` accepts a boolean or a string flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueInitialized {
    Bool(bool),
    Text(String),
}

impl ValueInitialized {
    pub fn is_enabled(&self) -> bool {
        match self {
            ValueInitialized::Bool(b) => *b,
            ValueInitialized::Text(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        }
    }
}

/// Flags toggling each sub-computation of the fusion attention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterFusionConfig {
    pub key: bool,
    pub query: bool,
    pub value: bool,
    pub query_before_ln: bool,
    pub regularization: bool,
    pub residual_before: bool,
    pub temperature: bool,
    pub value_before_softmax: bool,
    pub value_initialized: ValueInitialized,
}

impl Default for AdapterFusionConfig {
    fn default() -> Self {
        Self::dynamic()
    }
}

impl AdapterFusionConfig {
    /// Learned query and key, adapter outputs used as values
    pub fn static_fusion() -> Self {
        Self {
            key: true,
            query: true,
            value: false,
            query_before_ln: false,
            regularization: false,
            residual_before: false,
            temperature: false,
            value_before_softmax: true,
            value_initialized: ValueInitialized::Bool(false),
        }
    }

    /// Learned query, key and identity-initialized value with regularization
    pub fn dynamic() -> Self {
        Self {
            value: true,
            regularization: true,
            value_initialized: ValueInitialized::Bool(true),
            ..Self::static_fusion()
        }
    }

    pub fn with_temperature(&self, temperature: bool) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }

    pub fn with_residual_before(&self, residual_before: bool) -> Self {
        Self {
            residual_before,
            ..self.clone()
        }
    }

    pub fn with_query_before_ln(&self, query_before_ln: bool) -> Self {
        Self {
            query_before_ln,
            ..self.clone()
        }
    }
}
