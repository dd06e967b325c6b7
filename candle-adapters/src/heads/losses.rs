//! Head losses
//!
//! All losses return a scalar tensor connected to the logits' graph.
//! Integer labels are read back to the host to build gather indices.

use crate::core::AdapterResult;
use crate::precondition_error;
use candle_core::{DType, Tensor, D};

/// Labels of any numeric dtype as a flat `i64` vector
pub fn label_values(labels: &Tensor) -> AdapterResult<Vec<i64>> {
    Ok(labels.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?)
}

/// Mean softmax cross-entropy over rows where `keep` is set
///
/// `logits` is `(n, classes)`. Returns a zero scalar when no row is kept.
pub fn masked_cross_entropy(logits: &Tensor, labels: &[i64], keep: &[bool]) -> AdapterResult<Tensor> {
    let (rows, classes) = logits.dims2()?;
    if labels.len() != rows || keep.len() != rows {
        return Err(precondition_error!(
            "cross_entropy",
            format!(
                "{} logit rows but {} labels and {} mask entries",
                rows,
                labels.len(),
                keep.len()
            )
        ));
    }
    let kept = keep.iter().filter(|k| **k).count();
    if kept == 0 {
        return Ok(Tensor::zeros((), logits.dtype(), logits.device())?);
    }

    let mut index = Vec::with_capacity(rows);
    let mut weights = Vec::with_capacity(rows);
    for (&label, &k) in labels.iter().zip(keep) {
        if k && (label < 0 || label as usize >= classes) {
            return Err(precondition_error!(
                "cross_entropy",
                format!("label {} outside [0, {})", label, classes)
            ));
        }
        index.push(if k { label as u32 } else { 0 });
        weights.push(if k { 1f32 } else { 0f32 });
    }

    let device = logits.device();
    let index = Tensor::from_vec(index, (rows, 1), device)?;
    let weights = Tensor::from_vec(weights, rows, device)?.to_dtype(logits.dtype())?;
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&index, 1)?.squeeze(1)?;
    let total = picked.mul(&weights)?.sum_all()?.neg()?;
    Ok((total / kept as f64)?)
}

/// Cross-entropy ignoring negative labels
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> AdapterResult<Tensor> {
    let labels = label_values(labels)?;
    let keep: Vec<bool> = labels.iter().map(|l| *l >= 0).collect();
    masked_cross_entropy(logits, &labels, &keep)
}

/// Mean squared error between flattened predictions and targets
pub fn mse(predictions: &Tensor, targets: &Tensor) -> AdapterResult<Tensor> {
    let predictions = predictions.flatten_all()?;
    let targets = targets.flatten_all()?.to_dtype(predictions.dtype())?;
    Ok(candle_nn::loss::mse(&predictions, &targets)?)
}

/// Binary cross-entropy on logits, averaged over every element
///
/// Uses `max(x, 0) - x * y + log(1 + exp(-|x|))`, which stays finite for large logits.
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> AdapterResult<Tensor> {
    let targets = targets.to_dtype(logits.dtype())?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = logits.relu()?.sub(&logits.mul(&targets)?)?.add(&softplus)?;
    Ok(loss.mean_all()?)
}
