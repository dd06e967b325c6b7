//! Tests for head losses

use super::losses::*;
use crate::test_fixtures::fixtures::*;
use candle_core::{Device, Tensor};
use rstest::*;

fn scalar(t: &Tensor) -> f32 {
    t.to_scalar::<f32>().unwrap()
}

#[rstest]
fn test_cross_entropy_uniform_logits(device: Device) {
    let logits = Tensor::zeros((3, 4), candle_core::DType::F32, &device).unwrap();
    let labels = Tensor::new(&[0i64, 1, 3], &device).unwrap();
    let loss = cross_entropy(&logits, &labels).unwrap();
    assert!((scalar(&loss) - 4f32.ln()).abs() < 1e-5);
}

#[rstest]
fn test_cross_entropy_ignores_negative_labels(device: Device) {
    let logits = Tensor::new(&[[10f32, 0.0], [0.0, 10.0]], &device).unwrap();
    let confident = cross_entropy(&logits, &Tensor::new(&[0i64, -100], &device).unwrap()).unwrap();
    let wrong = cross_entropy(&logits, &Tensor::new(&[1i64, -100], &device).unwrap()).unwrap();
    assert!(scalar(&confident) < 1e-3);
    assert!(scalar(&wrong) > 9.0);
}

#[rstest]
fn test_masked_cross_entropy_all_ignored_is_zero(device: Device) {
    let logits = Tensor::randn(0f32, 1.0, (2, 5), &device).unwrap();
    let loss = masked_cross_entropy(&logits, &[7, 7], &[false, false]).unwrap();
    assert_eq!(loss.dims(), &[] as &[usize]);
    assert_eq!(scalar(&loss), 0.0);
}

#[rstest]
fn test_masked_cross_entropy_rejects_out_of_range_label(device: Device) {
    let logits = Tensor::zeros((1, 3), candle_core::DType::F32, &device).unwrap();
    assert!(masked_cross_entropy(&logits, &[3], &[true]).is_err());
    assert!(masked_cross_entropy(&logits, &[0, 1], &[true, true]).is_err());
}

#[rstest]
fn test_mse(device: Device) {
    let predictions = Tensor::new(&[[1f32], [3.0]], &device).unwrap();
    let targets = Tensor::new(&[0f32, 1.0], &device).unwrap();
    assert!((scalar(&mse(&predictions, &targets).unwrap()) - 2.5).abs() < 1e-6);
}

#[rstest]
fn test_binary_cross_entropy_with_logits(device: Device) {
    let logits = Tensor::zeros((2, 2), candle_core::DType::F32, &device).unwrap();
    let targets = Tensor::new(&[[1u32, 0], [0, 1]], &device).unwrap();
    let loss = binary_cross_entropy_with_logits(&logits, &targets).unwrap();
    assert!((scalar(&loss) - 2f32.ln()).abs() < 1e-5);
}

#[rstest]
fn test_binary_cross_entropy_with_extreme_logits(device: Device) {
    let logits = Tensor::new(&[[200f32, -200.], [200., -200.]], &device).unwrap();
    let matching = Tensor::new(&[[1u32, 0], [1, 0]], &device).unwrap();
    let loss = scalar(&binary_cross_entropy_with_logits(&logits, &matching).unwrap());
    assert!(loss.is_finite() && loss.abs() < 1e-5, "loss {}", loss);

    let opposite = Tensor::new(&[[0u32, 1], [0, 1]], &device).unwrap();
    let loss = scalar(&binary_cross_entropy_with_logits(&logits, &opposite).unwrap());
    assert!((loss - 200.0).abs() < 1e-3, "loss {}", loss);
}

#[rstest]
fn test_label_values_accepts_float_labels(device: Device) {
    let labels = Tensor::new(&[[2f32], [0.0]], &device).unwrap();
    assert_eq!(label_values(&labels).unwrap(), vec![2, 0]);
}
