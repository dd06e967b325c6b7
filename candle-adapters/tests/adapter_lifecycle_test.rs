//! End-to-end adapter lifecycle against the public API
//!
//! Builds a tiny BERT checkpoint on disk, trains-selects an adapter with a
//! head, saves it and loads it into a second model over the same checkpoint.

use candle_adapters::model_architectures::ActivationFunction;
use candle_adapters::{
    AdapterCompositionBlock, AdapterEncoder, AdapterModel, EncoderConfig, ForwardOptions, HeadConfig, HeadInputs,
    LoRAConfig,
};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

fn tiny_config() -> EncoderConfig {
    EncoderConfig {
        vocab_size: 32,
        hidden_size: 16,
        num_hidden_layers: 2,
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

/// Write `config.json` and `model.safetensors` for a random encoder
fn write_checkpoint(dir: &Path, config: &EncoderConfig, device: &Device) -> anyhow::Result<()> {
    let mut tensors = HashMap::new();
    for (name, shape) in config.weight_shapes() {
        let tensor = if name.ends_with("LayerNorm.weight") {
            Tensor::ones(shape, DType::F32, device)?
        } else {
            Tensor::randn(0f32, 0.02, shape, device)?
        };
        tensors.insert(name, tensor);
    }
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(config)?)?;
    Ok(())
}

fn inputs(device: &Device) -> anyhow::Result<(Tensor, Tensor)> {
    let ids = Tensor::new(&[[1u32, 5, 9, 2], [3, 7, 11, 0]], device)?;
    let mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], device)?;
    Ok((ids, mask))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn test_train_save_and_reload_adapter_with_head() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let checkpoint = tempfile::tempdir()?;
    let bundle = tempfile::tempdir()?;
    write_checkpoint(checkpoint.path(), &tiny_config(), &device)?;

    let mut model = AdapterModel::new(AdapterEncoder::from_pretrained(checkpoint.path(), &device)?);
    model.add_adapter("sentiment", "pfeiffer", false)?;
    model.add_prediction_head("sentiment", HeadConfig::classification(2), false)?;
    model.train_adapter("sentiment")?;

    let (ids, mask) = inputs(&device)?;
    let labels = Tensor::new(&[0u32, 1], &device)?;
    let options = ForwardOptions::default()
        .with_train(true)
        .with_head_inputs(HeadInputs::default().with_labels(labels));
    let output = model.forward(&ids, Some(&mask), &options)?;
    let head_output = output.head_output().expect("classification head output");
    let loss = head_output.loss.as_ref().expect("loss with labels");

    let grads = loss.backward()?;
    let trainable = model.trainable_parameters();
    assert!(trainable.iter().any(|(key, _)| key.contains(".adapters.sentiment.")));
    assert!(trainable.iter().any(|(_, var)| grads.get(var.as_tensor()).is_some()));

    model.save_adapter(bundle.path(), "sentiment", true)?;
    let expected = model.forward(&ids, Some(&mask), &ForwardOptions::default())?;

    let mut reloaded = AdapterModel::new(AdapterEncoder::from_pretrained(checkpoint.path(), &device)?);
    let name = reloaded.load_adapter(bundle.path(), None)?;
    assert_eq!(name, "sentiment");
    reloaded.set_active_adapters(name.as_str())?;
    assert_eq!(reloaded.active_head(), Some("sentiment"));

    let actual = reloaded.forward(&ids, Some(&mask), &ForwardOptions::default())?;
    let diff = max_abs_diff(
        &expected.head_output().expect("logits").logits,
        &actual.head_output().expect("logits").logits,
    )?;
    assert!(diff < 1e-5, "reloaded logits differ by {}", diff);
    Ok(())
}

#[test]
fn test_merged_lora_matches_active_lora() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut model = AdapterModel::new(AdapterEncoder::new_random(&tiny_config(), &device)?);
    let (ids, mask) = inputs(&device)?;

    model.add_adapter("lora", LoRAConfig::builder().r(4).alpha(8.0).build()?, false)?;
    for (_, var) in model.adapter_state("lora") {
        var.set(&Tensor::randn(0f32, 0.3, var.dims(), &device)?)?;
    }
    let active_setup = AdapterCompositionBlock::stack(["lora"])?;
    let active = model.forward_hidden(&ids, Some(&mask), &ForwardOptions::default().with_setup(active_setup))?;

    model.merge_adapter("lora")?;
    let merged = model.forward_hidden(&ids, Some(&mask), &ForwardOptions::default())?;
    assert!(max_abs_diff(&active, &merged)? < 1e-3);

    model.reset_adapter()?;
    model.delete_adapter("lora")?;
    assert!(!model.has_adapter("lora"));
    Ok(())
}
