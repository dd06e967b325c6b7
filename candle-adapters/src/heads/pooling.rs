//! Sequence pooling for heads that predict from one vector per input
//!
//! ## Supported Pooling Methods
//! - **CLS Pooling**: first token embedding, the default for classification heads
//! - **Mean Pooling**: average of the valid token embeddings
//! - **Last Token Pooling**: embedding of the last valid token

use crate::core::AdapterResult;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

/// How a classification-style head reduces `(batch, seq, hidden)` to `(batch, hidden)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingStrategy {
    #[default]
    Cls,
    Mean,
    LastToken,
}

impl PoolingStrategy {
    /// Pool `hidden_states`; mean and last-token pooling fall back to CLS
    /// pooling when no attention mask is available
    pub fn pool(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> AdapterResult<Tensor> {
        match (self, attention_mask) {
            (PoolingStrategy::Mean, Some(mask)) => mean_pool(hidden_states, mask),
            (PoolingStrategy::LastToken, Some(mask)) => last_token_pool(hidden_states, mask),
            _ => cls_pool(hidden_states),
        }
    }
}

/// Mean pooling weighted by the attention mask
///
/// ## Arguments
/// - `hidden_states`: `[batch_size, seq_len, hidden_size]`
/// - `attention_mask`: `[batch_size, seq_len]`, any numeric dtype
///
/// ## Return
/// `[batch_size, hidden_size]`
pub fn mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> AdapterResult<Tensor> {
    let mask_expanded = attention_mask
        .to_dtype(hidden_states.dtype())?
        .unsqueeze(2)? // [batch, seq_len, 1]
        .expand(hidden_states.dims())?; // [batch, seq_len, hidden]

    let sum_hidden = hidden_states.mul(&mask_expanded)?.sum(1)?;
    // clamp avoids 0/0 for fully padded rows
    let sum_mask = mask_expanded.sum(1)?.maximum(1e-9)?;
    Ok(sum_hidden.div(&sum_mask)?)
}

/// Last valid token pooling
///
/// Left padding (every row ends with a valid token) selects the final
/// position directly; right padding gathers position `len - 1` per row.
pub fn last_token_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> AdapterResult<Tensor> {
    let (batch_size, seq_len, _hidden_size) = hidden_states.dims3()?;

    let last_col_sum = attention_mask
        .narrow(1, seq_len - 1, 1)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    if (last_col_sum as usize) == batch_size {
        return Ok(hidden_states.narrow(1, seq_len - 1, 1)?.squeeze(1)?);
    }

    let sequence_lengths = attention_mask
        .to_dtype(DType::F32)?
        .sum(1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?;

    let mut embeddings = Vec::with_capacity(batch_size);
    for (batch_idx, &len) in sequence_lengths.iter().enumerate() {
        let seq_idx = len.saturating_sub(1) as usize;
        embeddings.push(hidden_states.i((batch_idx, seq_idx))?.unsqueeze(0)?);
    }
    Ok(Tensor::cat(&embeddings, 0)?)
}

/// First token (`[CLS]`) pooling
pub fn cls_pool(hidden_states: &Tensor) -> AdapterResult<Tensor> {
    Ok(hidden_states.narrow(1, 0, 1)?.squeeze(1)?)
}
