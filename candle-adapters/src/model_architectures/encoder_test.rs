//! Tests for the reference encoder host

use super::encoder::*;
use crate::composition::AdapterCompositionBlock;
use crate::config::{AdapterConfig, BottleneckConfig, LoRAConfig, PrefixTuningConfig};
use crate::model_architectures::traits::{AdapterInjection, ForwardContext};
use crate::test_fixtures::fixtures::*;
use candle_core::{Device, Tensor};
use rstest::*;
use std::collections::HashSet;

fn add_everywhere(encoder: &mut AdapterEncoder, name: &str, config: &AdapterConfig) -> usize {
    encoder
        .injection_points_mut()
        .into_iter()
        .map(|(_, point)| point.add_adapter(name, config).unwrap())
        .filter(|created| *created)
        .count()
}

// ============================================================================
// Configuration
// ============================================================================

#[rstest]
fn test_config_defaults_fill_missing_fields() {
    let config: EncoderConfig =
        serde_json::from_str(r#"{"hidden_size": 16, "num_attention_heads": 2, "hidden_act": "gelu"}"#).unwrap();
    assert_eq!(config.hidden_size, 16);
    assert_eq!(config.num_hidden_layers, 12);
    assert_eq!(config.vocab_size, 30522);
    assert!(config.validate().is_ok());
}

#[rstest]
fn test_config_rejects_uneven_heads(tiny_config: EncoderConfig) {
    let config = EncoderConfig {
        num_attention_heads: 3,
        ..tiny_config
    };
    assert!(config.validate().is_err());
}

#[rstest]
fn test_weight_shapes_cover_every_layer(tiny_config: EncoderConfig) {
    let shapes = tiny_config.weight_shapes();
    // 5 embedding tensors, 16 per layer
    assert_eq!(shapes.len(), 5 + 16 * TINY_LAYERS);
    assert!(shapes
        .iter()
        .any(|(name, shape)| name == "encoder.layer.1.intermediate.dense.weight" && shape == &vec![32, TINY_HIDDEN]));
}

// ============================================================================
// Injection points
// ============================================================================

#[rstest]
fn test_injection_point_paths_are_unique(tiny_encoder: AdapterEncoder) {
    let points = tiny_encoder.injection_points();
    assert_eq!(points.len(), 2 + 8 * TINY_LAYERS);
    let paths: HashSet<&String> = points.iter().map(|(p, _)| p).collect();
    assert_eq!(paths.len(), points.len());
    assert!(paths.contains(&"encoder.layer.0.attention.self.query".to_string()));
    assert!(paths.contains(&"encoder.layer.1.output".to_string()));
}

#[rstest]
#[case(BottleneckConfig::pfeiffer().into(), TINY_LAYERS)]
#[case(BottleneckConfig::houlsby().into(), 2 * TINY_LAYERS)]
#[case(BottleneckConfig::pfeiffer_inv().into(), TINY_LAYERS + 1)]
#[case(LoRAConfig::default().into(), 2 * TINY_LAYERS)]
#[case(LoRAConfig::ia3().into(), 3 * TINY_LAYERS)]
#[case(PrefixTuningConfig::default().into(), TINY_LAYERS + 1)]
fn test_adapter_placement(
    mut tiny_encoder: AdapterEncoder,
    #[case] config: AdapterConfig,
    #[case] expected_points: usize,
) {
    assert_eq!(add_everywhere(&mut tiny_encoder, "a", &config), expected_points);
}

// ============================================================================
// Forward
// ============================================================================

#[rstest]
fn test_forward_shape(tiny_encoder: AdapterEncoder, device: Device) {
    let ids = sample_input_ids(&device, 2, 5);
    let mask = full_mask(&device, 2, 5);
    let out = tiny_encoder
        .forward(&ids, Some(&mask), &ForwardContext::default())
        .unwrap();
    assert_eq!(out.dims(), &[2, 5, TINY_HIDDEN]);
}

#[rstest]
fn test_inactive_adapters_do_not_change_output(mut tiny_encoder: AdapterEncoder, device: Device) {
    let ids = sample_input_ids(&device, 1, 4);
    let before = tiny_encoder.forward(&ids, None, &ForwardContext::default()).unwrap();
    add_everywhere(&mut tiny_encoder, "a", &BottleneckConfig::houlsby().into());
    let after = tiny_encoder.forward(&ids, None, &ForwardContext::default()).unwrap();
    assert!(max_abs_diff(&before, &after) < 1e-6);
}

#[rstest]
fn test_parallel_doubles_batch_through_layers(mut tiny_encoder: AdapterEncoder, device: Device) {
    let config: AdapterConfig = BottleneckConfig::pfeiffer().into();
    add_everywhere(&mut tiny_encoder, "a", &config);
    add_everywhere(&mut tiny_encoder, "b", &config);

    let ids = sample_input_ids(&device, 2, 4);
    let mask = full_mask(&device, 2, 4);
    let ctx = ForwardContext::new(Some(AdapterCompositionBlock::parallel(vec!["a", "b"]).unwrap()), false);
    let out = tiny_encoder.forward(&ids, Some(&mask), &ctx).unwrap();
    assert_eq!(out.dims(), &[4, 4, TINY_HIDDEN]);
}

#[rstest]
fn test_prefix_tuning_forward_shape(mut tiny_encoder: AdapterEncoder, device: Device) {
    let config: AdapterConfig = PrefixTuningConfig {
        prefix_length: 3,
        bottleneck_size: 8,
        ..PrefixTuningConfig::default()
    }
    .into();
    add_everywhere(&mut tiny_encoder, "p", &config);

    let ids = sample_input_ids(&device, 2, 4);
    let mask = full_mask(&device, 2, 4);
    let ctx = ForwardContext::new(Some(AdapterCompositionBlock::stack(vec!["p"]).unwrap()), false);
    let with_prefix = tiny_encoder.forward(&ids, Some(&mask), &ctx).unwrap();
    let without = tiny_encoder.forward(&ids, Some(&mask), &ForwardContext::default()).unwrap();
    assert_eq!(with_prefix.dims(), &[2, 4, TINY_HIDDEN]);
    assert!(max_abs_diff(&with_prefix, &without) > 0.0);
}

#[rstest]
fn test_invert_hidden_states_undoes_embedding_adapter(mut tiny_encoder: AdapterEncoder, device: Device) {
    add_everywhere(&mut tiny_encoder, "inv", &BottleneckConfig::pfeiffer_inv().into());
    let ctx = ForwardContext::new(Some(AdapterCompositionBlock::stack(vec!["inv"]).unwrap()), false);
    let hidden = Tensor::randn(0f32, 1.0, (1, 3, TINY_HIDDEN), &device).unwrap();

    let restored = tiny_encoder.invert_hidden_states(&hidden, &ctx).unwrap();
    assert!(max_abs_diff(&restored, &hidden) > 0.0);

    let untouched = tiny_encoder
        .invert_hidden_states(&hidden, &ForwardContext::default())
        .unwrap();
    assert!(max_abs_diff(&untouched, &hidden) < 1e-6);
}
