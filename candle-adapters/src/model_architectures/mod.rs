//! # Model Architectures
//!
//! Injection points hosting adapter modules, the fusion layer, trainable
//! parameter building blocks and a reference encoder host.

pub mod activation;
pub mod bottleneck;
pub mod encoder;
pub mod fusion;
pub mod lora;
pub mod parameters;
pub mod prefix_tuning;
pub mod traits;

pub use activation::ActivationFunction;
pub use bottleneck::{BottleneckAdapter, BottleneckLayer, BottleneckLocation, InvertibleAdaptersLayer};
pub use encoder::{AdapterEncoder, EncoderConfig};
pub use fusion::BertFusion;
pub use lora::{LoRAAdapter, LoRALinear, LoRALocation};
pub use prefix_tuning::{PrefixStates, PrefixTuningLayer, PrefixTuningPool};
pub use traits::{groups, AdapterInjection, ForwardContext, InjectionPoint};

#[cfg(test)]
pub mod encoder_test;
#[cfg(test)]
pub mod prefix_tuning_test;
