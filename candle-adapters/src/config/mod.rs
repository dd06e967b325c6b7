//! # Adapter Configuration
//!
//! Immutable adapter and fusion configs, presets and the config registry.

pub mod adapter_config;
pub mod fusion_config;
pub mod registry;

pub use adapter_config::{
    config_hash, AdapterConfig, BottleneckConfig, BottleneckConfigBuilder, BottleneckInit,
    CompositionMode, InvertibleAdapterKind, LoRAConfig, LoRAConfigBuilder, LoRAInit,
    PrefixTuningConfig, ReductionFactor,
};
pub use fusion_config::{AdapterFusionConfig, ValueInitialized};
pub use registry::{
    ConfigRegistry, ConfigSource, NamedConfig, DEFAULT_ADAPTERFUSION_CONFIG,
    DEFAULT_ADAPTER_CONFIG,
};
