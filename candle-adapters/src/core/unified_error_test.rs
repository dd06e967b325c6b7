//! Tests for unified_error module

use super::unified_error::*;
use candle_core::{DType, Device, Tensor};
use rstest::*;

/// Test AdapterError formatting carries operation, reason and context
#[rstest]
#[case("add_adapter", "reduction factor missing", Some("layer 3".to_string()))]
#[case("resolve", "bad json", None)]
fn test_configuration_error_formatting(
    #[case] operation: &str,
    #[case] reason: &str,
    #[case] context: Option<String>,
) {
    let error = AdapterError::Configuration {
        operation: operation.to_string(),
        reason: reason.to_string(),
        context: context.clone(),
    };

    let error_string = format!("{}", error);
    assert!(error_string.contains(operation));
    assert!(error_string.contains(reason));
    if let Some(ref ctx) = context {
        assert!(error_string.contains(ctx));
    } else {
        assert!(!error_string.contains("context:"));
    }
    assert_eq!(error.kind(), "ConfigurationError");
}

#[rstest]
#[case(lookup_errors::unknown_adapter("a"), "UnknownAdapterError")]
#[case(lookup_errors::unknown_head("h"), "UnknownHeadError")]
#[case(lookup_errors::unknown_config("foo"), "UnknownConfigError")]
#[case(
    AdapterError::AlreadyMerged {
        location: "encoder.layer.0.attention.self.query".to_string(),
        merged: "a".to_string(),
        requested: "b".to_string(),
    },
    "AlreadyMergedError"
)]
#[case(
    AdapterError::DuplicateHead { name: "h".to_string() },
    "DuplicateHeadError"
)]
fn test_error_kinds(#[case] error: AdapterError, #[case] expected: &str) {
    assert_eq!(error.kind(), expected);
    assert!(!error.to_string().is_empty());
}

#[rstest]
fn test_already_merged_message_names_both_adapters() {
    let error = AdapterError::AlreadyMerged {
        location: "point".to_string(),
        merged: "first".to_string(),
        requested: "second".to_string(),
    };
    let msg = error.to_string();
    assert!(msg.contains("first"));
    assert!(msg.contains("second"));
    assert!(msg.contains("point"));
}

// ============================================================================
// Conversion Tests
// ============================================================================

#[rstest]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
    let error: AdapterError = io_error.into();
    assert_eq!(error.kind(), "IOError");
    assert!(error.to_string().contains("missing.json"));
}

#[rstest]
fn test_serde_error_conversion() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let error: AdapterError = parse.unwrap_err().into();
    assert_eq!(error.kind(), "SerializationError");
}

#[rstest]
fn test_candle_error_roundtrip() {
    let candle_error = candle_core::Error::Msg("shape mismatch".to_string());
    let error: AdapterError = candle_error.into();
    assert_eq!(error.kind(), "ExternalError");

    let back: candle_core::Error = error.into();
    assert!(back.to_string().contains("shape mismatch"));
}

#[rstest]
fn test_error_unification_adds_context() {
    let result: Result<(), String> = Err("boom".to_string());
    let error = result
        .with_config_context("register", Some("name: lora"))
        .unwrap_err();
    match error {
        AdapterError::Configuration {
            operation, context, ..
        } => {
            assert_eq!(operation, "register");
            assert_eq!(context.as_deref(), Some("name: lora"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[rstest]
fn test_macros_build_expected_variants() {
    let config = crate::config_error!("op", "bad");
    assert_eq!(config.kind(), "ConfigurationError");
    let composition = crate::composition_error!("loc", "arity");
    assert_eq!(composition.kind(), "CompositionError");
    let precondition = crate::precondition_error!("merge", "zero entry");
    assert_eq!(precondition.kind(), "PreconditionError");
}

// ============================================================================
// Compatibility Checks
// ============================================================================

#[rstest]
fn test_ensure_compatible_accepts_matching_tensors() {
    let device = Device::Cpu;
    let a = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
    let b = Tensor::ones((3, 2), DType::F32, &device).unwrap();
    assert!(ensure_compatible("forward", &a, &b).is_ok());
}

#[rstest]
fn test_ensure_compatible_rejects_dtype_mismatch() {
    let device = Device::Cpu;
    let a = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
    let b = Tensor::zeros((2, 2), DType::F64, &device).unwrap();
    let err = ensure_compatible("merge", &a, &b).unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
}
