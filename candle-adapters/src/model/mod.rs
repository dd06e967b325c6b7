//! # Adapter Model
//!
//! Model-wide adapter registry and the `AdapterModel` facade over a host
//! implementing `AdapterInjection`.

pub mod adapter_model;
pub mod adapters_config;

pub use adapter_model::{
    AdapterBundleConfig, AdapterModel, FusionBundleConfig, ForwardOptions, HeadBundleConfig,
};
pub use adapters_config::ModelAdaptersConfig;
