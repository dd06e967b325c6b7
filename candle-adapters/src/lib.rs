//! # candle-adapters
//!
//! Adapter composition and activation engine for frozen candle models.
//!
//! Many named adapters (bottleneck, Compacter/PHM, LoRA, IA³, prefix tuning,
//! invertible embedding adapters) attach to the injection points of a host
//! model and are combined per forward pass with the composition operators
//! Stack, Fuse, Split, Parallel, BatchSplit and Average. LoRA adapters can
//! be merged into the base weights and reset exactly.
//!
//! ```rust,ignore
//! use candle_adapters::{AdapterEncoder, AdapterModel, ForwardOptions, HeadConfig};
//!
//! let mut model = AdapterModel::new(AdapterEncoder::from_pretrained(dir, &device)?);
//! model.add_adapter("sst-2", "pfeiffer", false)?;
//! model.add_prediction_head("sst-2", HeadConfig::classification(2), false)?;
//! model.train_adapter("sst-2")?;
//! let out = model.forward(&input_ids, Some(&mask), &ForwardOptions::default())?;
//! ```

pub mod composition;
pub mod config;
pub mod core;
pub mod heads;
pub mod model;
pub mod model_architectures;

// Shared rstest fixtures
pub mod test_fixtures;

pub use composition::{parse_composition, AdapterCompositionBlock};
pub use config::{
    AdapterConfig, AdapterFusionConfig, BottleneckConfig, ConfigSource, LoRAConfig, PrefixTuningConfig,
};
pub use core::{AdapterError, AdapterResult};
pub use heads::{DispatchOutput, HeadConfig, HeadDispatch, HeadInputs, HeadOutput};
pub use model::{AdapterModel, ForwardOptions, ModelAdaptersConfig};
pub use model_architectures::{AdapterEncoder, AdapterInjection, EncoderConfig, ForwardContext, InjectionPoint};
