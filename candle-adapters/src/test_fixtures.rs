//! Shared Test Fixtures for candle-adapters
//!
//! Reusable rstest fixtures and helpers: a device, temporary directories and
//! a tiny randomly initialized encoder so that every test runs offline.

#[cfg(test)]
pub mod fixtures {
    use crate::model::AdapterModel;
    use crate::model_architectures::activation::ActivationFunction;
    use crate::model_architectures::encoder::{AdapterEncoder, EncoderConfig};
    use candle_core::{DType, Device, Tensor};
    use rstest::*;
    use tempfile::TempDir;

    /// Vocabulary size of the tiny encoder
    pub const TINY_VOCAB: usize = 32;
    pub const TINY_HIDDEN: usize = 16;
    pub const TINY_LAYERS: usize = 2;

    /// Device fixture, CPU for deterministic tests
    #[fixture]
    pub fn device() -> Device {
        Device::Cpu
    }

    /// Temporary directory fixture for save/load tests
    #[fixture]
    pub fn temp_dir() -> TempDir {
        tempfile::tempdir().expect("Failed to create temporary directory")
    }

    /// BERT-style configuration small enough for exhaustive tests
    #[fixture]
    pub fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            vocab_size: TINY_VOCAB,
            hidden_size: TINY_HIDDEN,
            num_hidden_layers: TINY_LAYERS,
            num_attention_heads: 2,
            intermediate_size: 32,
            hidden_act: ActivationFunction::Gelu,
            hidden_dropout_prob: 0.0,
            attention_probs_dropout_prob: 0.0,
            max_position_embeddings: 64,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
        }
    }

    /// Randomly initialized tiny encoder
    #[fixture]
    pub fn tiny_encoder(device: Device, tiny_config: EncoderConfig) -> AdapterEncoder {
        AdapterEncoder::new_random(&tiny_config, &device).expect("Failed to build tiny encoder")
    }

    /// Adapter model over the tiny encoder
    #[fixture]
    pub fn tiny_model(tiny_encoder: AdapterEncoder) -> AdapterModel<AdapterEncoder> {
        AdapterModel::new(tiny_encoder)
    }

    /// Deterministic token ids `(batch, seq)` inside the tiny vocabulary
    pub fn sample_input_ids(device: &Device, batch: usize, seq: usize) -> Tensor {
        let ids: Vec<u32> = (0..batch * seq)
            .map(|i| ((i * 7 + 3) % TINY_VOCAB) as u32)
            .collect();
        Tensor::from_vec(ids, (batch, seq), device).expect("Failed to build input ids")
    }

    /// All-ones attention mask `(batch, seq)`
    pub fn full_mask(device: &Device, batch: usize, seq: usize) -> Tensor {
        Tensor::ones((batch, seq), DType::U32, device).expect("Failed to build mask")
    }

    /// Largest absolute elementwise difference
    pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .and_then(|d| d.abs())
            .and_then(|d| d.flatten_all())
            .and_then(|d| d.max(0))
            .and_then(|d| d.to_dtype(DType::F32))
            .and_then(|d| d.to_scalar::<f32>())
            .expect("Failed to compare tensors")
    }
}
