//! Tests for head registration and dispatch

use super::dispatch::*;
use super::prediction_head::*;
use crate::core::{AdapterError, AdapterResult};
use crate::model_architectures::parameters::zeros_var;
use crate::test_fixtures::fixtures::*;
use candle_core::{DType, Device, Tensor, Var};
use rstest::*;
use serde_json::json;

const HIDDEN: usize = 8;

#[fixture]
fn dispatch(device: Device) -> HeadDispatch {
    HeadDispatch::new(HIDDEN, &device, DType::F32).with_dropout(0.0)
}

/// Sums the hidden states over the sequence and scales them
#[derive(Debug)]
struct ScaleHead {
    scale: Var,
}

impl CustomHead for ScaleHead {
    fn forward(&self, hidden_states: &Tensor, _inputs: &HeadInputs, _train: bool) -> AdapterResult<HeadOutput> {
        let logits = hidden_states.sum(1)?.broadcast_mul(self.scale.as_tensor())?;
        Ok(HeadOutput {
            logits,
            end_logits: None,
            loss: None,
        })
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        vec![("scale".to_string(), self.scale.clone())]
    }
}

fn scale_builder() -> CustomHeadBuilder {
    Box::new(|_name: &str, _params: &serde_json::Value, ctx: &HeadBuildContext| {
        Ok(Box::new(ScaleHead {
            scale: zeros_var(1, &ctx.device, ctx.dtype)?,
        }) as Box<dyn CustomHead>)
    })
}

// ============================================================================
// Registration
// ============================================================================

#[rstest]
fn test_add_sets_active_and_derives_labels(mut dispatch: HeadDispatch) {
    dispatch.add_prediction_head("sst", HeadConfig::classification(2), false).unwrap();
    assert_eq!(dispatch.active_head(), Some("sst"));
    assert_eq!(dispatch.labels(None).unwrap(), Some(vec!["LABEL_0".to_string(), "LABEL_1".to_string()]));
    assert_eq!(dispatch.labels_dict(Some("sst")).unwrap().unwrap()[&1], "LABEL_1");
}

#[rstest]
fn test_duplicate_head_requires_overwrite(mut dispatch: HeadDispatch) {
    dispatch.add_prediction_head("a", HeadConfig::classification(2), false).unwrap();
    let err = dispatch
        .add_prediction_head("a", HeadConfig::tagging(5), false)
        .unwrap_err();
    assert!(matches!(err, AdapterError::DuplicateHead { .. }));

    dispatch.add_prediction_head("a", HeadConfig::tagging(5), true).unwrap();
    assert_eq!(dispatch.head("a").unwrap().config().head_type(), "tagging");
}

#[rstest]
fn test_delete_clears_active(mut dispatch: HeadDispatch) {
    dispatch.add_prediction_head("a", HeadConfig::classification(2), false).unwrap();
    dispatch.delete_head("a").unwrap();
    assert_eq!(dispatch.active_head(), None);
    assert!(matches!(dispatch.delete_head("a"), Err(AdapterError::UnknownHead { .. })));
}

#[rstest]
fn test_set_active_head_validates_name(mut dispatch: HeadDispatch) {
    dispatch.add_prediction_head("a", HeadConfig::classification(2), false).unwrap();
    dispatch.add_prediction_head("b", HeadConfig::classification(2), false).unwrap();
    dispatch.set_active_head(Some("a")).unwrap();
    assert_eq!(dispatch.active_head(), Some("a"));
    assert!(dispatch.set_active_head(Some("missing")).is_err());
    dispatch.set_active_head(None).unwrap();
    assert_eq!(dispatch.active_head(), None);
}

#[rstest]
fn test_labels_without_any_head(dispatch: HeadDispatch) {
    assert!(matches!(dispatch.labels(None), Err(AdapterError::Precondition { .. })));
    assert!(matches!(dispatch.labels(Some("x")), Err(AdapterError::UnknownHead { .. })));
}

#[rstest]
fn test_head_parameters_are_prefixed(mut dispatch: HeadDispatch) {
    dispatch.add_prediction_head("qa", HeadConfig::question_answering(), false).unwrap();
    let names: Vec<String> = dispatch.head_parameters("qa").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["heads.qa.1.weight", "heads.qa.1.bias"]);
    assert!(dispatch.head_parameters("other").is_empty());
}

// ============================================================================
// Forward dispatch
// ============================================================================

#[rstest]
fn test_no_head_returns_hidden_states(dispatch: HeadDispatch, device: Device) {
    let hidden = Tensor::randn(0f32, 1.0, (2, 3, HIDDEN), &device).unwrap();
    let out = dispatch
        .forward_head(&hidden, None, &HeadInputs::default(), false)
        .unwrap();
    assert!(max_abs_diff(out.hidden_states().unwrap(), &hidden) == 0.0);
    assert!(out.head_output().is_none());
}

#[rstest]
fn test_unknown_head_name_fails(mut dispatch: HeadDispatch, device: Device) {
    dispatch.add_prediction_head("a", HeadConfig::classification(2), false).unwrap();
    let hidden = Tensor::zeros((1, 2, HIDDEN), DType::F32, &device).unwrap();
    let err = dispatch
        .forward_head(&hidden, Some("b"), &HeadInputs::default(), false)
        .unwrap_err();
    assert!(matches!(err, AdapterError::UnknownHead { .. }));
}

#[rstest]
fn test_explicit_name_beats_active_head(mut dispatch: HeadDispatch, device: Device) {
    dispatch.add_prediction_head("cls", HeadConfig::classification(3), false).unwrap();
    dispatch.add_prediction_head("tag", HeadConfig::tagging(5), false).unwrap();
    let hidden = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &device).unwrap();

    let active = dispatch.forward_head(&hidden, None, &HeadInputs::default(), false).unwrap();
    assert!(matches!(&active, DispatchOutput::Head { name, .. } if name == "tag"));
    assert_eq!(active.head_output().unwrap().logits.dims(), &[2, 4, 5]);

    let explicit = dispatch
        .forward_head(&hidden, Some("cls"), &HeadInputs::default(), false)
        .unwrap();
    assert_eq!(explicit.head_output().unwrap().logits.dims(), &[2, 3]);
}

// ============================================================================
// Custom heads
// ============================================================================

#[rstest]
fn test_unregistered_custom_head_is_configuration_error(mut dispatch: HeadDispatch) {
    let err = dispatch
        .add_prediction_head("c", HeadConfig::custom("scale", json!({})), false)
        .unwrap_err();
    assert!(matches!(err, AdapterError::Configuration { .. }));
}

#[rstest]
fn test_registered_custom_head(mut dispatch: HeadDispatch, device: Device) {
    dispatch.register_custom_head("scale", scale_builder());
    dispatch
        .add_prediction_head("c", HeadConfig::custom("scale", json!({"factor": 2})), false)
        .unwrap();
    assert_eq!(dispatch.head_parameters("c")[0].0, "heads.c.scale");
    assert!(dispatch.labels(None).unwrap().is_none());

    let hidden = Tensor::ones((2, 3, HIDDEN), DType::F32, &device).unwrap();
    let out = dispatch.forward_head(&hidden, None, &HeadInputs::default(), false).unwrap();
    assert_eq!(out.head_output().unwrap().logits.dims(), &[2, HIDDEN]);
}
