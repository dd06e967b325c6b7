//! Tests for prediction heads

use super::prediction_head::*;
use super::pooling::PoolingStrategy;
use crate::model_architectures::activation::ActivationFunction;
use crate::test_fixtures::fixtures::*;
use candle_core::{DType, Device, Tensor};
use rstest::*;

const HIDDEN: usize = 8;

fn build_context(device: &Device) -> HeadBuildContext {
    HeadBuildContext {
        hidden_size: HIDDEN,
        dropout: 0.0,
        device: device.clone(),
        dtype: DType::F32,
    }
}

fn hidden(device: &Device, batch: usize, seq: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, seq, HIDDEN), device).unwrap()
}

// ============================================================================
// HeadConfig
// ============================================================================

#[rstest]
fn test_config_tagged_by_head_type() {
    let config: HeadConfig =
        serde_json::from_str(r#"{"head_type": "classification", "num_labels": 3}"#).unwrap();
    assert_eq!(config, HeadConfig::classification(3));

    let json = serde_json::to_value(HeadConfig::question_answering()).unwrap();
    assert_eq!(json["head_type"], "question_answering");
    assert_eq!(json["num_labels"], 2);
    assert_eq!(json["activation_function"], "tanh");
}

#[rstest]
#[case(HeadConfig::classification(3), "classification")]
#[case(HeadConfig::multilabel_classification(3), "multilabel_classification")]
#[case(HeadConfig::tagging(3), "tagging")]
#[case(HeadConfig::multiple_choice(4), "multiple_choice")]
#[case(HeadConfig::seq2seq_lm(32), "seq2seq_lm")]
fn test_head_type_names(#[case] config: HeadConfig, #[case] expected: &str) {
    assert_eq!(config.head_type(), expected);
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["head_type"], expected);
}

#[rstest]
fn test_default_labels_derived_from_class_count() {
    let config = HeadConfig::multiple_choice(3).with_default_labels();
    let labels = config.label2id().unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels["LABEL_2"], 2);
    assert!(HeadConfig::seq2seq_lm(10).with_default_labels().label2id().is_none());
}

#[rstest]
fn test_explicit_labels_are_kept() {
    let map = [("neg".to_string(), 0), ("pos".to_string(), 1)].into_iter().collect();
    let config = HeadConfig::classification(2).with_label2id(map).with_default_labels();
    assert_eq!(config.label2id().unwrap()["pos"], 1);
}

#[rstest]
fn test_validate_rejects_bad_shapes() {
    assert!(HeadConfig::classification(2).with_layers(0).validate().is_err());
    assert!(HeadConfig::classification(0).validate().is_err());
    let qa: HeadConfig =
        serde_json::from_str(r#"{"head_type": "question_answering", "num_labels": 3}"#).unwrap();
    assert!(qa.validate().is_err());
}

// ============================================================================
// Forward per head type
// ============================================================================

#[rstest]
fn test_parameter_names_follow_block_positions(device: Device) {
    let head = PredictionHead::new("h", HeadConfig::classification(3), &build_context(&device)).unwrap();
    let names: Vec<String> = head.named_vars().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["1.weight", "1.bias", "4.weight", "4.bias"]);
}

#[rstest]
fn test_classification_logits_and_loss(device: Device) {
    let head = PredictionHead::new("h", HeadConfig::classification(3), &build_context(&device)).unwrap();
    let inputs = HeadInputs::default().with_labels(Tensor::new(&[0u32, 2], &device).unwrap());
    let out = head.forward(&hidden(&device, 2, 5), &inputs, false).unwrap();
    assert_eq!(out.logits.dims(), &[2, 3]);
    assert!(out.loss.unwrap().to_scalar::<f32>().unwrap() > 0.0);
}

#[rstest]
fn test_regression_uses_squared_error(device: Device) {
    let head = PredictionHead::new("h", HeadConfig::classification(1), &build_context(&device)).unwrap();
    let inputs = HeadInputs::default().with_labels(Tensor::new(&[0.5f32, -1.0], &device).unwrap());
    let out = head.forward(&hidden(&device, 2, 3), &inputs, false).unwrap();
    assert_eq!(out.logits.dims(), &[2, 1]);
    assert!(out.loss.is_some());
}

#[rstest]
fn test_cls_output_replaces_pooling(device: Device) {
    let config = HeadConfig::Classification {
        num_labels: 2,
        layers: 1,
        activation_function: ActivationFunction::Tanh,
        label2id: None,
        pooling: PoolingStrategy::Mean,
    };
    let head = PredictionHead::new("h", config, &build_context(&device)).unwrap();
    let cls = Tensor::zeros((4, HIDDEN), DType::F32, &device).unwrap();
    let inputs = HeadInputs {
        cls_output: Some(cls),
        ..HeadInputs::default()
    };
    let out = head.forward(&hidden(&device, 2, 3), &inputs, false).unwrap();
    // zero bias and zero input give zero logits for the overriding batch of 4
    assert_eq!(out.logits.dims(), &[4, 2]);
    assert!(max_abs_diff(&out.logits, &Tensor::zeros((4, 2), DType::F32, &device).unwrap()) < 1e-6);
}

#[rstest]
fn test_multilabel_loss(device: Device) {
    let head =
        PredictionHead::new("h", HeadConfig::multilabel_classification(3), &build_context(&device)).unwrap();
    let labels = Tensor::new(&[[1u32, 0, 1], [0, 0, 0]], &device).unwrap();
    let out = head
        .forward(&hidden(&device, 2, 4), &HeadInputs::default().with_labels(labels), false)
        .unwrap();
    assert_eq!(out.logits.dims(), &[2, 3]);
    assert!(out.loss.unwrap().to_scalar::<f32>().unwrap() > 0.0);
}

#[rstest]
fn test_tagging_masks_padding(device: Device) {
    let head = PredictionHead::new("h", HeadConfig::tagging(4), &build_context(&device)).unwrap();
    let labels = Tensor::new(&[[1u32, 2, 3]], &device).unwrap();
    let mask = Tensor::new(&[[0u32, 0, 0]], &device).unwrap();
    let inputs = HeadInputs::default().with_labels(labels).with_attention_mask(mask);
    let out = head.forward(&hidden(&device, 1, 3), &inputs, false).unwrap();
    assert_eq!(out.logits.dims(), &[1, 3, 4]);
    assert_eq!(out.loss.unwrap().to_scalar::<f32>().unwrap(), 0.0);
}

#[rstest]
fn test_question_answering_clamps_out_of_range_positions(device: Device) {
    let head = PredictionHead::new("qa", HeadConfig::question_answering(), &build_context(&device)).unwrap();
    let seq_len = 128;
    let positions = Tensor::new(&[200i64, 200], &device).unwrap();
    let inputs = HeadInputs::default().with_positions(positions.clone(), positions);
    let out = head.forward(&hidden(&device, 2, seq_len), &inputs, false).unwrap();

    assert_eq!(out.logits.dims(), &[2, seq_len]);
    assert_eq!(out.end_logits.as_ref().unwrap().dims(), &[2, seq_len]);
    // clamped to the sequence length, hence ignored
    assert_eq!(out.loss.unwrap().to_scalar::<f32>().unwrap(), 0.0);
}

#[rstest]
fn test_question_answering_in_range_positions_contribute(device: Device) {
    let head = PredictionHead::new("qa", HeadConfig::question_answering(), &build_context(&device)).unwrap();
    let inputs = HeadInputs::default().with_positions(
        Tensor::new(&[1i64, -3], &device).unwrap(),
        Tensor::new(&[2i64, 50], &device).unwrap(),
    );
    let out = head.forward(&hidden(&device, 2, 6), &inputs, false).unwrap();
    assert!(out.loss.unwrap().to_scalar::<f32>().unwrap() > 0.0);
}

#[rstest]
fn test_multiple_choice_reshapes_to_choices(device: Device) {
    let head = PredictionHead::new("mc", HeadConfig::multiple_choice(3), &build_context(&device)).unwrap();
    let inputs = HeadInputs::default().with_labels(Tensor::new(&[2u32, 0], &device).unwrap());
    let out = head.forward(&hidden(&device, 6, 4), &inputs, false).unwrap();
    assert_eq!(out.logits.dims(), &[2, 3]);
    assert!(out.loss.is_some());

    assert!(head.forward(&hidden(&device, 4, 4), &HeadInputs::default(), false).is_err());
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_seq2seq_lm_logits_and_loss(device: Device, #[case] shift_labels: bool) {
    let config = HeadConfig::Seq2seqLm {
        vocab_size: 11,
        layers: 1,
        activation_function: ActivationFunction::Gelu,
        shift_labels,
    };
    let head = PredictionHead::new("lm", config, &build_context(&device)).unwrap();
    let labels = Tensor::new(&[[3i64, -100, 7, 1]], &device).unwrap();
    let out = head
        .forward(&hidden(&device, 1, 4), &HeadInputs::default().with_labels(labels), false)
        .unwrap();
    assert_eq!(out.logits.dims(), &[1, 4, 11]);
    assert!(out.loss.unwrap().to_scalar::<f32>().unwrap() > 0.0);
}
