//! Tests for prefix tuning

use super::prefix_tuning::*;
use crate::composition::AdapterCompositionBlock;
use crate::config::{AdapterConfig, BottleneckConfig, PrefixTuningConfig};
use crate::core::AdapterError;
use crate::model_architectures::traits::{ForwardContext, InjectionPoint};
use crate::test_fixtures::fixtures::*;
use candle_core::{DType, Device, Tensor};
use rstest::*;

const LAYERS: usize = 2;
const HEADS: usize = 2;
const HIDDEN: usize = 8;

fn prefix_config(flat: bool) -> AdapterConfig {
    PrefixTuningConfig {
        prefix_length: 3,
        bottleneck_size: 4,
        ..PrefixTuningConfig::default()
    }
    .with_flat(flat)
    .into()
}

fn pool(device: &Device, flat: bool) -> PrefixTuningPool {
    let mut pool = PrefixTuningPool::new(LAYERS, HEADS, HIDDEN, device, DType::F32);
    assert!(pool.add_adapter("p", &prefix_config(flat)).unwrap());
    pool
}

fn stack_ctx(names: Vec<&str>) -> ForwardContext {
    ForwardContext::new(Some(AdapterCompositionBlock::stack(names).unwrap()), false)
}

#[rstest]
fn test_pool_ignores_other_methods(device: Device) {
    let mut pool = PrefixTuningPool::new(LAYERS, HEADS, HIDDEN, &device, DType::F32);
    assert!(!pool.add_adapter("b", &BottleneckConfig::pfeiffer().into()).unwrap());
    assert!(pool.adapter_names().is_empty());
}

#[rstest]
#[case(false, vec!["wte.weight", "control_trans.0.weight", "control_trans.0.bias", "control_trans.2.weight", "control_trans.2.bias"])]
#[case(true, vec!["control_trans"])]
fn test_pool_parameter_names(device: Device, #[case] flat: bool, #[case] expected: Vec<&str>) {
    let pool = pool(&device, flat);
    let names: Vec<String> = pool.adapter_parameters("p").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, expected);
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_pool_generates_prefixes_per_layer(device: Device, #[case] flat: bool) {
    let pool = pool(&device, flat);
    let states = pool.forward(4, &stack_ctx(vec!["p"])).unwrap();
    assert_eq!(states.names(), vec!["p".to_string()]);
    for layer in 0..LAYERS {
        let (key, value) = states.get("p", layer).unwrap();
        assert_eq!(key.dims(), &[4, HEADS, 3, HIDDEN / HEADS]);
        assert_eq!(value.dims(), &[4, HEADS, 3, HIDDEN / HEADS]);
    }
    assert!(states.get("p", LAYERS).is_none());
}

#[rstest]
fn test_pool_without_setup_is_empty(device: Device) {
    let pool = pool(&device, false);
    assert!(pool.forward(2, &ForwardContext::default()).unwrap().is_empty());
    assert!(pool.forward(2, &stack_ctx(vec!["other"])).unwrap().is_empty());
}

#[rstest]
fn test_layer_prepends_prefix_and_opens_mask(device: Device) {
    let pool = pool(&device, false);
    let mut layer = PrefixTuningLayer::new(1);
    assert!(layer.add_adapter("p", &prefix_config(false)).unwrap());

    let ctx = stack_ctx(vec!["p"]);
    let states = pool.forward(2, &ctx).unwrap();
    let key = Tensor::randn(0f32, 1.0, (2, HEADS, 5, HIDDEN / HEADS), &device).unwrap();
    let value = Tensor::randn(0f32, 1.0, (2, HEADS, 5, HIDDEN / HEADS), &device).unwrap();
    let mask = Tensor::full(-10000f32, (2, 1, 1, 5), &device).unwrap();

    let (k, v, m) = layer.forward(&key, &value, Some(&mask), &states, &ctx).unwrap();
    assert_eq!(k.dims(), &[2, HEADS, 8, HIDDEN / HEADS]);
    assert_eq!(v.dims(), &[2, HEADS, 8, HIDDEN / HEADS]);
    let m = m.unwrap();
    assert_eq!(m.dims(), &[2, 1, 1, 8]);

    let prefix_part = m.narrow(3, 0, 3).unwrap();
    assert!(max_abs_diff(&prefix_part, &Tensor::zeros((2, 1, 1, 3), DType::F32, &device).unwrap()) < 1e-6);
    assert!(max_abs_diff(&k.narrow(2, 3, 5).unwrap(), &key) < 1e-6);
}

#[rstest]
fn test_layer_respects_leave_out() {
    let mut layer = PrefixTuningLayer::new(0);
    let config: AdapterConfig = PrefixTuningConfig {
        leave_out: vec![0],
        ..PrefixTuningConfig::default()
    }
    .into();
    assert!(!layer.add_adapter("p", &config).unwrap());
}

#[rstest]
fn test_layer_rejects_parallel(device: Device) {
    let pool = pool(&device, false);
    let mut layer = PrefixTuningLayer::new(0);
    layer.add_adapter("p", &prefix_config(false)).unwrap();

    let ctx = ForwardContext::new(Some(AdapterCompositionBlock::parallel(vec!["p", "q"]).unwrap()), false);
    let states = pool.forward(1, &ctx).unwrap();
    let key = Tensor::zeros((1, HEADS, 2, HIDDEN / HEADS), DType::F32, &device).unwrap();
    let err = layer.forward(&key, &key, None, &states, &ctx).unwrap_err();
    assert!(matches!(err, AdapterError::Composition { .. }));
}

#[rstest]
fn test_layer_without_hosted_adapter_passes_through(device: Device) {
    let layer = PrefixTuningLayer::new(0);
    let key = Tensor::ones((1, HEADS, 2, HIDDEN / HEADS), DType::F32, &device).unwrap();
    let (k, _, m) = layer
        .forward(&key, &key, None, &PrefixStates::default(), &stack_ctx(vec!["p"]))
        .unwrap();
    assert_eq!(k.dims(), key.dims());
    assert!(m.is_none());
}
