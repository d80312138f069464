use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};

use crate::data::{Batch, SampleSource};
use crate::model::{padding_mask, zero_sentinel, PolicyModel, Seq2SeqPolicy};

/// Injected loss contract: differentiable scalar for one batch.
pub type LossFn<M> = dyn Fn(&M, &Batch) -> Result<Tensor>;

/// Injected evaluation contract: (accuracy, mean test loss) over a held-out
/// source. Must not mutate model parameters.
pub type EvalFn<M> = dyn Fn(&M, &SampleSource, &LossFn<M>) -> Result<(f32, f32)>;

/// Negative log-likelihood over log-probabilities, with sentinel target
/// positions excluded from the average.
pub fn masked_nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, v) = log_probs.dims3()?;
    let mask = padding_mask(targets)?;
    let safe = zero_sentinel(targets, &mask)?;

    let picked = log_probs
        .contiguous()?
        .reshape((b * t, v))?
        .gather(&safe.contiguous()?.reshape((b * t, 1))?, 1)?
        .reshape((b, t))?;

    // keep = 1 at real targets, 0 at padding
    let keep = mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    let count = keep.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        bail!("every target position in the batch is padding");
    }
    Ok(((picked.neg()? * keep)?.sum_all()? / count as f64)?)
}

/// Teacher-forced training loss: predict action tokens 2..M from their
/// prefixes, ignoring padded positions.
pub fn policy_loss(model: &Seq2SeqPolicy, batch: &Batch) -> Result<Tensor> {
    let m = batch.action.dim(1)?;
    if m < 2 {
        bail!("action sequences must contain the start token plus one move");
    }
    let log_probs = model.forward(&batch.state, &batch.action)?;
    let targets = batch.action.narrow(1, 1, m - 1)?;
    masked_nll(&log_probs, &targets)
}

/// Held-out evaluation: token-level accuracy of the arg-max prediction over
/// non-padding targets, plus the mean batch loss. Runs the forward pass
/// only; no gradient step ever happens here.
pub fn eval_policy(
    model: &Seq2SeqPolicy,
    source: &SampleSource,
    loss_fn: &LossFn<Seq2SeqPolicy>,
) -> Result<(f32, f32)> {
    let mut correct = 0usize;
    let mut total = 0usize;
    let mut loss_sum = 0f32;
    let mut batches = 0usize;

    for batch in source.ordered_batches() {
        let batch = batch?;
        loss_sum += loss_fn(model, &batch)?.to_scalar::<f32>()?;
        batches += 1;

        let m = batch.action.dim(1)?;
        let log_probs = model.forward(&batch.state, &batch.action)?;
        let predicted = log_probs
            .argmax(D::Minus1)?
            .to_dtype(DType::I64)?
            .to_vec2::<i64>()?;
        let targets = batch.action.narrow(1, 1, m - 1)?.to_vec2::<i64>()?;

        for (pred_row, tgt_row) in predicted.iter().zip(targets.iter()) {
            for (&p, &t) in pred_row.iter().zip(tgt_row.iter()) {
                if t == crate::model::SENTINEL {
                    continue;
                }
                total += 1;
                if p == t {
                    correct += 1;
                }
            }
        }
    }

    if batches == 0 || total == 0 {
        bail!("held-out source produced no full batches to evaluate");
    }
    Ok((correct as f32 / total as f32, loss_sum / batches as f32))
}
