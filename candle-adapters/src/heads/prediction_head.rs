//! Prediction heads
//!
//! A head is a stack of `layers` blocks (dropout, dense, activation) built
//! against the host's hidden size. The last dense layer projects to the
//! head's output size and has no activation. Parameter names follow the
//! position of each dense layer in that block sequence (`1.weight`,
//! `4.weight`, ...).

use crate::config_error;
use crate::core::AdapterResult;
use crate::heads::losses::{
    binary_cross_entropy_with_logits, cross_entropy, label_values, masked_cross_entropy, mse,
};
use crate::heads::pooling::PoolingStrategy;
use crate::model_architectures::activation::ActivationFunction;
use crate::model_architectures::parameters::ParamLinear;
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Dropout;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Label name to class index
pub type Label2Id = BTreeMap<String, usize>;

const HEAD_INIT_STD: f64 = 0.02;

fn default_layers() -> usize {
    2
}

fn default_single_layer() -> usize {
    1
}

fn default_activation() -> ActivationFunction {
    ActivationFunction::Tanh
}

fn default_qa_labels() -> usize {
    2
}

/// Head configuration, tagged by `head_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "head_type", rename_all = "snake_case")]
pub enum HeadConfig {
    Classification {
        num_labels: usize,
        #[serde(default = "default_layers")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        #[serde(default)]
        label2id: Option<Label2Id>,
        #[serde(default)]
        pooling: PoolingStrategy,
    },
    MultilabelClassification {
        num_labels: usize,
        #[serde(default = "default_layers")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        #[serde(default)]
        label2id: Option<Label2Id>,
        #[serde(default)]
        pooling: PoolingStrategy,
    },
    Tagging {
        num_labels: usize,
        #[serde(default = "default_single_layer")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        #[serde(default)]
        label2id: Option<Label2Id>,
    },
    QuestionAnswering {
        #[serde(default = "default_qa_labels")]
        num_labels: usize,
        #[serde(default = "default_single_layer")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        #[serde(default)]
        label2id: Option<Label2Id>,
    },
    MultipleChoice {
        num_choices: usize,
        #[serde(default = "default_layers")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        #[serde(default)]
        label2id: Option<Label2Id>,
    },
    /// Token-level projection onto the vocabulary
    Seq2seqLm {
        vocab_size: usize,
        #[serde(default = "default_single_layer")]
        layers: usize,
        #[serde(default = "default_activation")]
        activation_function: ActivationFunction,
        /// Predict token `t + 1` from position `t` (causal models)
        #[serde(default)]
        shift_labels: bool,
    },
    /// Head built by a registered custom builder
    Custom {
        identifier: String,
        #[serde(default)]
        params: Value,
    },
}

impl HeadConfig {
    pub fn classification(num_labels: usize) -> Self {
        HeadConfig::Classification {
            num_labels,
            layers: default_layers(),
            activation_function: default_activation(),
            label2id: None,
            pooling: PoolingStrategy::Cls,
        }
    }

    pub fn multilabel_classification(num_labels: usize) -> Self {
        HeadConfig::MultilabelClassification {
            num_labels,
            layers: default_layers(),
            activation_function: default_activation(),
            label2id: None,
            pooling: PoolingStrategy::Cls,
        }
    }

    pub fn tagging(num_labels: usize) -> Self {
        HeadConfig::Tagging {
            num_labels,
            layers: default_single_layer(),
            activation_function: default_activation(),
            label2id: None,
        }
    }

    pub fn question_answering() -> Self {
        HeadConfig::QuestionAnswering {
            num_labels: default_qa_labels(),
            layers: default_single_layer(),
            activation_function: default_activation(),
            label2id: None,
        }
    }

    pub fn multiple_choice(num_choices: usize) -> Self {
        HeadConfig::MultipleChoice {
            num_choices,
            layers: default_layers(),
            activation_function: default_activation(),
            label2id: None,
        }
    }

    pub fn seq2seq_lm(vocab_size: usize) -> Self {
        HeadConfig::Seq2seqLm {
            vocab_size,
            layers: default_single_layer(),
            activation_function: default_activation(),
            shift_labels: false,
        }
    }

    pub fn custom(identifier: &str, params: Value) -> Self {
        HeadConfig::Custom {
            identifier: identifier.to_string(),
            params,
        }
    }

    pub fn head_type(&self) -> &'static str {
        match self {
            HeadConfig::Classification { .. } => "classification",
            HeadConfig::MultilabelClassification { .. } => "multilabel_classification",
            HeadConfig::Tagging { .. } => "tagging",
            HeadConfig::QuestionAnswering { .. } => "question_answering",
            HeadConfig::MultipleChoice { .. } => "multiple_choice",
            HeadConfig::Seq2seqLm { .. } => "seq2seq_lm",
            HeadConfig::Custom { .. } => "custom",
        }
    }

    /// `(layers, activation)` of the dense stack, `None` for custom heads
    fn mlp_shape(&self) -> Option<(usize, ActivationFunction)> {
        match self {
            HeadConfig::Classification { layers, activation_function, .. }
            | HeadConfig::MultilabelClassification { layers, activation_function, .. }
            | HeadConfig::Tagging { layers, activation_function, .. }
            | HeadConfig::QuestionAnswering { layers, activation_function, .. }
            | HeadConfig::MultipleChoice { layers, activation_function, .. }
            | HeadConfig::Seq2seqLm { layers, activation_function, .. } => Some((*layers, *activation_function)),
            HeadConfig::Custom { .. } => None,
        }
    }

    /// Width of the last dense layer
    pub fn output_size(&self) -> Option<usize> {
        match self {
            HeadConfig::Classification { num_labels, .. }
            | HeadConfig::MultilabelClassification { num_labels, .. }
            | HeadConfig::Tagging { num_labels, .. }
            | HeadConfig::QuestionAnswering { num_labels, .. } => Some(*num_labels),
            HeadConfig::MultipleChoice { .. } => Some(1),
            HeadConfig::Seq2seqLm { vocab_size, .. } => Some(*vocab_size),
            HeadConfig::Custom { .. } => None,
        }
    }

    /// Number of classes a label map is derived for
    fn label_count(&self) -> Option<usize> {
        match self {
            HeadConfig::Classification { num_labels, .. }
            | HeadConfig::MultilabelClassification { num_labels, .. }
            | HeadConfig::Tagging { num_labels, .. }
            | HeadConfig::QuestionAnswering { num_labels, .. } => Some(*num_labels),
            HeadConfig::MultipleChoice { num_choices, .. } => Some(*num_choices),
            _ => None,
        }
    }

    pub fn label2id(&self) -> Option<&Label2Id> {
        match self {
            HeadConfig::Classification { label2id, .. }
            | HeadConfig::MultilabelClassification { label2id, .. }
            | HeadConfig::Tagging { label2id, .. }
            | HeadConfig::QuestionAnswering { label2id, .. }
            | HeadConfig::MultipleChoice { label2id, .. } => label2id.as_ref(),
            _ => None,
        }
    }

    pub fn with_label2id(&self, map: Label2Id) -> Self {
        let mut config = self.clone();
        match &mut config {
            HeadConfig::Classification { label2id, .. }
            | HeadConfig::MultilabelClassification { label2id, .. }
            | HeadConfig::Tagging { label2id, .. }
            | HeadConfig::QuestionAnswering { label2id, .. }
            | HeadConfig::MultipleChoice { label2id, .. } => *label2id = Some(map),
            _ => {}
        }
        config
    }

    pub fn with_layers(&self, n: usize) -> Self {
        let mut config = self.clone();
        match &mut config {
            HeadConfig::Classification { layers, .. }
            | HeadConfig::MultilabelClassification { layers, .. }
            | HeadConfig::Tagging { layers, .. }
            | HeadConfig::QuestionAnswering { layers, .. }
            | HeadConfig::MultipleChoice { layers, .. }
            | HeadConfig::Seq2seqLm { layers, .. } => *layers = n,
            HeadConfig::Custom { .. } => {}
        }
        config
    }

    pub fn with_activation(&self, activation: ActivationFunction) -> Self {
        let mut config = self.clone();
        match &mut config {
            HeadConfig::Classification { activation_function, .. }
            | HeadConfig::MultilabelClassification { activation_function, .. }
            | HeadConfig::Tagging { activation_function, .. }
            | HeadConfig::QuestionAnswering { activation_function, .. }
            | HeadConfig::MultipleChoice { activation_function, .. }
            | HeadConfig::Seq2seqLm { activation_function, .. } => *activation_function = activation,
            HeadConfig::Custom { .. } => {}
        }
        config
    }

    /// `LABEL_i` names for heads with a class count and no explicit map
    pub fn with_default_labels(&self) -> Self {
        match (self.label2id(), self.label_count()) {
            (None, Some(n)) => self.with_label2id((0..n).map(|i| (format!("LABEL_{}", i), i)).collect()),
            _ => self.clone(),
        }
    }

    /// Heads whose input must have embedding-level invertible adapters undone
    pub fn is_language_modeling(&self) -> bool {
        matches!(self, HeadConfig::Seq2seqLm { .. })
    }

    pub fn validate(&self) -> AdapterResult<()> {
        if let Some((layers, _)) = self.mlp_shape() {
            if layers == 0 {
                return Err(config_error!(self.head_type(), "a head needs at least one layer"));
            }
        }
        match self {
            HeadConfig::QuestionAnswering { num_labels, .. } if *num_labels != 2 => Err(config_error!(
                "question_answering",
                format!("expected 2 outputs (start, end), got {}", num_labels)
            )),
            _ if self.output_size() == Some(0) => Err(config_error!(self.head_type(), "output size must be positive")),
            _ => Ok(()),
        }
    }
}

/// Optional per-call inputs of a head
#[derive(Debug, Clone, Default)]
pub struct HeadInputs {
    pub labels: Option<Tensor>,
    pub start_positions: Option<Tensor>,
    pub end_positions: Option<Tensor>,
    /// `(batch, seq)` with 1 for real tokens
    pub attention_mask: Option<Tensor>,
    /// Precomputed pooled representation, replaces first-token pooling
    pub cls_output: Option<Tensor>,
}

impl HeadInputs {
    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_positions(mut self, start: Tensor, end: Tensor) -> Self {
        self.start_positions = Some(start);
        self.end_positions = Some(end);
        self
    }

    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }
}

/// Logits and optional loss of one head call
///
/// For question answering `logits` holds the start logits and
/// `end_logits` the end logits.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    pub logits: Tensor,
    pub end_logits: Option<Tensor>,
    pub loss: Option<Tensor>,
}

/// Shape information handed to custom head builders
#[derive(Debug, Clone)]
pub struct HeadBuildContext {
    pub hidden_size: usize,
    pub dropout: f32,
    pub device: Device,
    pub dtype: DType,
}

/// A user-provided head
pub trait CustomHead: fmt::Debug {
    fn forward(&self, hidden_states: &Tensor, inputs: &HeadInputs, train: bool) -> AdapterResult<HeadOutput>;

    /// Trainable parameters by local name
    fn named_vars(&self) -> Vec<(String, Var)>;
}

/// Builds a custom head from `(head name, params, shape context)`
pub type CustomHeadBuilder = Box<dyn Fn(&str, &Value, &HeadBuildContext) -> AdapterResult<Box<dyn CustomHead>>>;

#[derive(Debug)]
struct DenseStack {
    layers: Vec<ParamLinear>,
    activation: ActivationFunction,
    dropout: Dropout,
}

impl DenseStack {
    fn new(
        layers: usize,
        activation: ActivationFunction,
        out_size: usize,
        ctx: &HeadBuildContext,
    ) -> AdapterResult<Self> {
        let mut linears = Vec::with_capacity(layers);
        for l in 0..layers {
            let out_dim = if l + 1 < layers { ctx.hidden_size } else { out_size };
            linears.push(ParamLinear::normal(
                ctx.hidden_size,
                out_dim,
                HEAD_INIT_STD,
                true,
                &ctx.device,
                ctx.dtype,
            )?);
        }
        Ok(Self {
            layers: linears,
            activation,
            dropout: Dropout::new(ctx.dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> AdapterResult<Tensor> {
        let mut xs = xs.clone();
        let last = self.layers.len().saturating_sub(1);
        for (l, linear) in self.layers.iter().enumerate() {
            xs = self.dropout.forward(&xs, train)?;
            xs = linear.forward(&xs)?;
            if l < last {
                xs = self.activation.apply(&xs)?;
            }
        }
        Ok(xs)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        // dropout, dense, activation per block; the last block has no activation
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(l, linear)| linear.named_vars(&(3 * l + 1).to_string()))
            .collect()
    }
}

#[derive(Debug)]
enum HeadBody {
    Dense(DenseStack),
    Custom(Box<dyn CustomHead>),
}

/// A named head with its built parameters
#[derive(Debug)]
pub struct PredictionHead {
    name: String,
    config: HeadConfig,
    body: HeadBody,
}

impl PredictionHead {
    /// Build a head with a dense stack; custom heads go through [`PredictionHead::from_custom`]
    pub fn new(name: &str, config: HeadConfig, ctx: &HeadBuildContext) -> AdapterResult<Self> {
        config.validate()?;
        let (layers, activation) = config
            .mlp_shape()
            .ok_or_else(|| config_error!("PredictionHead::new", "custom heads need a registered builder"))?;
        let out_size = config.output_size().unwrap_or(1);
        Ok(Self {
            name: name.to_string(),
            body: HeadBody::Dense(DenseStack::new(layers, activation, out_size, ctx)?),
            config,
        })
    }

    pub fn from_custom(name: &str, config: HeadConfig, head: Box<dyn CustomHead>) -> Self {
        Self {
            name: name.to_string(),
            config,
            body: HeadBody::Custom(head),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: HeadConfig) {
        self.config = config;
    }

    /// Trainable parameters by local name
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        match &self.body {
            HeadBody::Dense(stack) => stack.named_vars(),
            HeadBody::Custom(head) => head.named_vars(),
        }
    }

    /// Logits and, when labels are given, the loss for `hidden_states` `(batch, seq, hidden)`
    pub fn forward(&self, hidden_states: &Tensor, inputs: &HeadInputs, train: bool) -> AdapterResult<HeadOutput> {
        let stack = match &self.body {
            HeadBody::Dense(stack) => stack,
            HeadBody::Custom(head) => return head.forward(hidden_states, inputs, train),
        };
        match &self.config {
            HeadConfig::Classification { num_labels, pooling, .. } => {
                let pooled = self.pooled(hidden_states, inputs, *pooling)?;
                let logits = stack.forward(&pooled, train)?;
                let loss = match &inputs.labels {
                    Some(labels) if *num_labels == 1 => Some(mse(&logits, labels)?),
                    Some(labels) => Some(cross_entropy(&logits, labels)?),
                    None => None,
                };
                Ok(single(logits, loss))
            }
            HeadConfig::MultilabelClassification { pooling, .. } => {
                let pooled = self.pooled(hidden_states, inputs, *pooling)?;
                let logits = stack.forward(&pooled, train)?;
                let loss = match &inputs.labels {
                    Some(labels) => Some(binary_cross_entropy_with_logits(&logits, labels)?),
                    None => None,
                };
                Ok(single(logits, loss))
            }
            HeadConfig::Tagging { num_labels, .. } => {
                let logits = stack.forward(hidden_states, train)?;
                let loss = match &inputs.labels {
                    Some(labels) => Some(tagging_loss(&logits, labels, inputs.attention_mask.as_ref(), *num_labels)?),
                    None => None,
                };
                Ok(single(logits, loss))
            }
            HeadConfig::QuestionAnswering { .. } => {
                let logits = stack.forward(hidden_states, train)?;
                let start_logits = logits.narrow(2, 0, 1)?.squeeze(2)?;
                let end_logits = logits.narrow(2, 1, 1)?.squeeze(2)?;
                let loss = match (&inputs.start_positions, &inputs.end_positions) {
                    (Some(start), Some(end)) => Some(span_loss(&start_logits, &end_logits, start, end)?),
                    _ => None,
                };
                Ok(HeadOutput {
                    logits: start_logits,
                    end_logits: Some(end_logits),
                    loss,
                })
            }
            HeadConfig::MultipleChoice { num_choices, .. } => {
                let pooled = self.pooled(hidden_states, inputs, PoolingStrategy::Cls)?;
                let scores = stack.forward(&pooled, train)?;
                let total = scores.elem_count();
                if total % num_choices != 0 {
                    return Err(config_error!(
                        "multiple_choice",
                        format!("{} inputs are not a multiple of {} choices", total, num_choices)
                    ));
                }
                let logits = scores.reshape((total / num_choices, *num_choices))?;
                let loss = match &inputs.labels {
                    Some(labels) => Some(cross_entropy(&logits, labels)?),
                    None => None,
                };
                Ok(single(logits, loss))
            }
            HeadConfig::Seq2seqLm { shift_labels, .. } => {
                let logits = stack.forward(hidden_states, train)?;
                let loss = match &inputs.labels {
                    Some(labels) => Some(lm_loss(&logits, labels, *shift_labels)?),
                    None => None,
                };
                Ok(single(logits, loss))
            }
            HeadConfig::Custom { .. } => Err(config_error!(
                "PredictionHead::forward",
                format!("head '{}' has a custom config but a dense body", self.name)
            )),
        }
    }

    fn pooled(&self, hidden_states: &Tensor, inputs: &HeadInputs, pooling: PoolingStrategy) -> AdapterResult<Tensor> {
        match &inputs.cls_output {
            Some(cls) => Ok(cls.clone()),
            None => pooling.pool(hidden_states, inputs.attention_mask.as_ref()),
        }
    }
}

fn single(logits: Tensor, loss: Option<Tensor>) -> HeadOutput {
    HeadOutput {
        logits,
        end_logits: None,
        loss,
    }
}

/// Token cross-entropy over positions with mask 1 and a non-negative label
fn tagging_loss(
    logits: &Tensor,
    labels: &Tensor,
    attention_mask: Option<&Tensor>,
    num_labels: usize,
) -> AdapterResult<Tensor> {
    let flat = logits.reshape(((), num_labels))?;
    let labels = label_values(labels)?;
    let keep: Vec<bool> = match attention_mask {
        Some(mask) => label_values(mask)?
            .iter()
            .zip(&labels)
            .map(|(m, l)| *m == 1 && *l >= 0)
            .collect(),
        None => labels.iter().map(|l| *l >= 0).collect(),
    };
    masked_cross_entropy(&flat, &labels, &keep)
}

/// Average of start and end cross-entropy
///
/// Positions are clamped to `[0, seq_len]`; a clamped position equal to
/// `seq_len` lies outside the input and is ignored.
fn span_loss(start_logits: &Tensor, end_logits: &Tensor, start: &Tensor, end: &Tensor) -> AdapterResult<Tensor> {
    let seq_len = start_logits.dim(1)? as i64;
    let position_loss = |logits: &Tensor, positions: &Tensor| -> AdapterResult<Tensor> {
        let positions: Vec<i64> = label_values(positions)?
            .into_iter()
            .map(|p| p.clamp(0, seq_len))
            .collect();
        let keep: Vec<bool> = positions.iter().map(|p| *p != seq_len).collect();
        masked_cross_entropy(logits, &positions, &keep)
    };
    let start_loss = position_loss(start_logits, start)?;
    let end_loss = position_loss(end_logits, end)?;
    Ok(((start_loss + end_loss)? / 2.0)?)
}

/// Token cross-entropy ignoring negative labels, optionally shifted by one
fn lm_loss(logits: &Tensor, labels: &Tensor, shift_labels: bool) -> AdapterResult<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let (logits, labels) = if shift_labels && seq_len > 1 {
        (
            logits.narrow(1, 0, seq_len - 1)?,
            labels.narrow(1, 1, seq_len - 1)?,
        )
    } else {
        (logits.clone(), labels.clone())
    };
    let rows = batch * logits.dim(1)?;
    cross_entropy(&logits.reshape((rows, vocab))?, &labels)
}
