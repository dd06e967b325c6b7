//! Tests for the LoRA injection point

use super::lora_linear::*;
use crate::composition::AdapterCompositionBlock;
use crate::config::{AdapterConfig, AdapterFusionConfig, CompositionMode, LoRAConfig, LoRAInit};
use crate::model_architectures::traits::{ForwardContext, InjectionPoint};
use crate::test_fixtures::fixtures::*;
use candle_core::{DType, Device, Tensor};
use rstest::*;

fn query_layer(device: &Device) -> LoRALinear {
    let weight = Tensor::randn(0f32, 1.0, (6, 4), device).unwrap();
    let bias = Tensor::randn(0f32, 1.0, 6, device).unwrap();
    LoRALinear::new(
        weight,
        Some(bias),
        LoRALocation::SelfAttention {
            attn_key: "q".to_string(),
        },
        Some(0),
    )
    .unwrap()
}

fn bert_lora(mode: CompositionMode) -> AdapterConfig {
    LoRAConfig::default()
        .with_r(2)
        .with_init_weights(LoRAInit::Bert)
        .with_composition_mode(mode)
        .into()
}

fn ctx(setup: &str) -> ForwardContext {
    ForwardContext::new(Some(AdapterCompositionBlock::Stack(vec![setup.into()])), false)
}

// ============================================================================
// Adding and applicability
// ============================================================================

#[rstest]
fn test_add_respects_attention_matrices(device: Device) {
    let mut layer = LoRALinear::new(
        Tensor::zeros((4, 4), DType::F32, &device).unwrap(),
        None,
        LoRALocation::SelfAttention {
            attn_key: "k".to_string(),
        },
        Some(0),
    )
    .unwrap();
    // default targets q and v
    let added = layer
        .add_adapter("a", &LoRAConfig::default().into())
        .unwrap();
    assert!(!added);
    assert!(!layer.has_adapter("a"));
}

#[rstest]
fn test_add_respects_leave_out(device: Device) {
    let mut layer = query_layer(&device);
    let config: AdapterConfig = LoRAConfig::builder().leave_out(vec![0]).build().unwrap().into();
    assert!(!layer.add_adapter("a", &config).unwrap());
}

#[rstest]
fn test_bottleneck_config_is_ignored(device: Device) {
    let mut layer = query_layer(&device);
    let config: AdapterConfig = crate::config::BottleneckConfig::pfeiffer().into();
    assert!(!layer.add_adapter("a", &config).unwrap());
}

// ============================================================================
// Forward
// ============================================================================

#[rstest]
fn test_forward_without_active_setup_is_base(device: Device) {
    let mut layer = query_layer(&device);
    let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &device).unwrap();
    let baseline = layer.forward(&x, &ForwardContext::default()).unwrap();

    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let inactive = layer.forward(&x, &ForwardContext::default()).unwrap();
    assert!(max_abs_diff(&baseline, &inactive) < 1e-6);

    let active = layer.forward(&x, &ctx("a")).unwrap();
    assert_eq!(active.dims(), &[2, 3, 6]);
    assert!(max_abs_diff(&baseline, &active) > 0.0);
}

#[rstest]
fn test_two_loras_at_once_is_composition_error(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    layer.add_adapter("b", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &device).unwrap();

    let stacked = ForwardContext::new(Some(AdapterCompositionBlock::stack(vec!["a", "b"]).unwrap()), false);
    let err = layer.forward(&x, &stacked).unwrap_err();
    assert_eq!(err.kind(), "CompositionError");

    let parallel = ForwardContext::new(Some(AdapterCompositionBlock::parallel(vec!["a", "b"]).unwrap()), false);
    assert_eq!(layer.forward(&x, &parallel).unwrap_err().kind(), "CompositionError");

    assert!(layer.forward(&x, &ctx("a")).is_ok());
    assert!(layer.forward(&x, &ctx("b")).is_ok());
}

#[rstest]
fn test_skipped_layer_uses_base(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &device).unwrap();
    let baseline = layer.forward(&x, &ForwardContext::default()).unwrap();
    let skipped = layer.forward(&x, &ctx("a").with_skip_layers(vec![0])).unwrap();
    assert!(max_abs_diff(&baseline, &skipped) < 1e-6);
}

#[rstest]
fn test_fuse_of_two_loras(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    layer.add_adapter("b", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &device).unwrap();
    let fuse = ForwardContext::new(Some(AdapterCompositionBlock::fuse(vec!["a", "b"]).unwrap()), false);

    // no fusion layer yet
    assert_eq!(layer.forward(&x, &fuse).unwrap_err().kind(), "CompositionError");

    let added = layer
        .add_fusion_layer(&["b".to_string(), "a".to_string()], &AdapterFusionConfig::dynamic())
        .unwrap();
    assert!(added);
    assert_eq!(layer.fusion_names(), vec!["a,b".to_string()]);
    let out = layer.forward(&x, &fuse).unwrap();
    assert_eq!(out.dims(), &[2, 3, 6]);
    assert!(layer.fusion_regularization_loss().unwrap().is_some());
}

// ============================================================================
// Merge / reset
// ============================================================================

#[rstest]
#[case(CompositionMode::Add)]
#[case(CompositionMode::Scale)]
fn test_merge_reset_roundtrip(device: Device, #[case] mode: CompositionMode) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(mode)).unwrap();
    let original = layer.weight().unwrap();

    assert!(layer.merge_adapter("a").unwrap());
    assert_eq!(layer.merged_adapter(), Some("a"));
    assert!(max_abs_diff(&original, &layer.weight().unwrap()) > 0.0);

    layer.reset_adapter().unwrap();
    assert_eq!(layer.merged_adapter(), None);
    assert!(max_abs_diff(&original, &layer.weight().unwrap()) < 1e-5);
}

#[rstest]
fn test_merged_forward_matches_unmerged(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &device).unwrap();
    let unmerged = layer.forward(&x, &ctx("a")).unwrap();

    layer.merge_adapter("a").unwrap();
    let merged = layer.forward(&x, &ctx("a")).unwrap();
    assert!(max_abs_diff(&unmerged, &merged) < 1e-5);
}

#[rstest]
fn test_second_merge_requires_reset(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    layer.add_adapter("b", &bert_lora(CompositionMode::Add)).unwrap();
    layer.merge_adapter("a").unwrap();
    // merging the same adapter again is a no-op
    assert!(layer.merge_adapter("a").unwrap());

    let err = layer.merge_adapter("b").unwrap_err();
    assert_eq!(err.kind(), "AlreadyMergedError");

    layer.reset_adapter().unwrap();
    assert!(layer.merge_adapter("b").unwrap());
}

#[rstest]
fn test_scale_merge_with_zero_update_is_rejected(device: Device) {
    let mut layer = query_layer(&device);
    // lora init leaves B at zero, so the update is all zeros
    let config: AdapterConfig = LoRAConfig::default()
        .with_composition_mode(CompositionMode::Scale)
        .into();
    layer.add_adapter("a", &config).unwrap();
    let err = layer.merge_adapter("a").unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
    assert_eq!(layer.merged_adapter(), None);
}

#[rstest]
fn test_delete_merged_adapter_restores_weight(device: Device) {
    let mut layer = query_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let original = layer.weight().unwrap();
    layer.merge_adapter("a").unwrap();
    layer.delete_adapter("a").unwrap();
    assert!(!layer.has_adapter("a"));
    assert_eq!(layer.merged_adapter(), None);
    assert!(max_abs_diff(&original, &layer.weight().unwrap()) < 1e-5);
}

#[rstest]
fn test_merge_unknown_adapter_is_noop(device: Device) {
    let mut layer = query_layer(&device);
    assert!(!layer.merge_adapter("missing").unwrap());
}

// ============================================================================
// Grouped q/k/v projection
// ============================================================================

fn grouped_layer(device: &Device) -> LoRALinear {
    let weight = Tensor::randn(0f32, 1.0, (12, 4), device).unwrap();
    LoRALinear::new(weight, None, LoRALocation::SelfAttentionGrouped, Some(1)).unwrap()
}

#[rstest]
#[case(CompositionMode::Add)]
#[case(CompositionMode::Scale)]
fn test_grouped_merge_reset_roundtrip(device: Device, #[case] mode: CompositionMode) {
    let mut layer = grouped_layer(&device);
    assert!(layer.add_adapter("a", &bert_lora(mode)).unwrap());
    let adapter = layer.adapter("a").unwrap();
    // q and v enabled: two groups of width 4
    assert_eq!(adapter.groups(), 2);
    assert_eq!(adapter.lora_b().unwrap().dims(), &[8, 2]);

    let original = layer.weight().unwrap();
    layer.merge_adapter("a").unwrap();
    let merged = layer.weight().unwrap();
    // the k block is untouched
    let k_before = original.narrow(0, 4, 4).unwrap();
    let k_after = merged.narrow(0, 4, 4).unwrap();
    assert!(max_abs_diff(&k_before, &k_after) < 1e-6);

    layer.reset_adapter().unwrap();
    assert!(max_abs_diff(&original, &layer.weight().unwrap()) < 1e-5);
}

#[rstest]
fn test_grouped_forward_matches_merged(device: Device) {
    let mut layer = grouped_layer(&device);
    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &device).unwrap();
    let unmerged = layer.forward(&x, &ctx("a")).unwrap();
    assert_eq!(unmerged.dims(), &[2, 3, 12]);

    layer.merge_adapter("a").unwrap();
    let merged = layer.forward(&x, &ctx("a")).unwrap();
    assert!(max_abs_diff(&unmerged, &merged) < 1e-5);
}

#[rstest]
fn test_ia3_vector_on_grouped_projection(device: Device) {
    let mut layer = grouped_layer(&device);
    assert!(layer.add_adapter("ia3", &LoRAConfig::ia3().into()).unwrap());
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &device).unwrap();
    let baseline = layer.forward(&x, &ForwardContext::default()).unwrap();
    // ones-initialized scaling vector leaves the output unchanged
    let out = layer.forward(&x, &ctx("ia3")).unwrap();
    assert!(max_abs_diff(&baseline, &out) < 1e-6);

    let original = layer.weight().unwrap();
    layer.merge_adapter("ia3").unwrap();
    layer.reset_adapter().unwrap();
    assert!(max_abs_diff(&original, &layer.weight().unwrap()) < 1e-6);
}

#[rstest]
fn test_fan_in_fan_out_layout(device: Device) {
    let host = Tensor::randn(0f32, 1.0, (4, 6), &device).unwrap();
    let mut layer = LoRALinear::from_fan_in_fan_out(
        host.clone(),
        None,
        LoRALocation::SelfAttention {
            attn_key: "v".to_string(),
        },
        Some(0),
    )
    .unwrap();
    assert_eq!(layer.out_features(), 6);
    assert_eq!(layer.weight().unwrap().dims(), &[4, 6]);

    layer.add_adapter("a", &bert_lora(CompositionMode::Add)).unwrap();
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &device).unwrap();
    assert_eq!(layer.forward(&x, &ctx("a")).unwrap().dims(), &[1, 2, 6]);
    layer.merge_adapter("a").unwrap();
    layer.reset_adapter().unwrap();
    assert!(max_abs_diff(&host, &layer.weight().unwrap()) < 1e-5);
}

#[rstest]
fn test_adapter_follows_weight_dtype(device: Device) {
    let weight = Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap().to_dtype(DType::F64).unwrap();
    let mut layer = LoRALinear::new(weight, None, LoRALocation::Intermediate, Some(0)).unwrap();
    let config: AdapterConfig = LoRAConfig::builder()
        .intermediate_lora(true)
        .init_weights(LoRAInit::Bert)
        .build()
        .unwrap()
        .into();
    layer.add_adapter("a", &config).unwrap();
    let adapter_dtype = layer.adapter("a").unwrap().lora_a().dtype();
    assert_eq!(adapter_dtype, DType::F64);
}
