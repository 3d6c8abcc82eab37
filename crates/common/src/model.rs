//! The model collaborator boundary.

use candle_core::{Result, Tensor};

/// A next-token sequence model trainable by the loop.
///
/// `forward` takes `(batch, seq_len)` token-id tensors and returns logits of
/// shape `(batch, seq_len, vocab)`. The loop owns the loss computation, so
/// `targets` is passed through for models that need it (masking, auxiliary
/// objectives) and may be ignored.
///
/// Trainable parameters are enumerated through the `VarMap` the model was
/// built from; the loop never mutates their membership.
pub trait SequenceModel {
    fn forward(&self, inputs: &Tensor, targets: &Tensor) -> Result<Tensor>;
}
