//! Token and positional embeddings.
//!
//! Converts integer token IDs into dense vectors by gathering rows of the
//! embedding matrix, then adds a learned absolute position embedding.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::{MammutError, Result};

/// Token embedding layer.
pub struct TokenEmbedding {
    /// Embedding weight matrix, shape `[vocab_size, width]`.
    pub weight: Tensor,
}

impl TokenEmbedding {
    pub fn new(vocab_size: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (vocab_size, width),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(TokenEmbedding { weight })
    }

    /// Look up embeddings for `[batch, seq_len]` token ids.
    ///
    /// Returns `[batch, seq_len, width]`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = token_ids.dims2()?;
        let width = self.weight.dim(1)?;
        let flat_ids = token_ids.flatten_all()?;
        let rows = self.weight.index_select(&flat_ids, 0)?;
        Ok(rows.reshape((batch, seq_len, width))?)
    }
}

/// Learned absolute position embedding, shape `[max_len, width]`.
///
/// Stored as the `positional_embedding` parameter of the owning tower.
pub struct PositionalEmbedding {
    pub weight: Tensor,
}

impl PositionalEmbedding {
    pub fn new(max_len: usize, width: usize, std: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (max_len, width),
            "positional_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: std,
            },
        )?;
        Ok(PositionalEmbedding { weight })
    }

    pub fn max_len(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Add the first `seq_len` positions to `x` of shape `[batch, seq_len, width]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        if seq_len > self.max_len() {
            return Err(MammutError::ShapeMismatch {
                expected: format!("at most {} positions", self.max_len()),
                got: seq_len.to_string(),
            });
        }
        let pos = self.weight.narrow(0, 0, seq_len)?.to_dtype(x.dtype())?;
        Ok(x.broadcast_add(&pos)?)
    }
}
