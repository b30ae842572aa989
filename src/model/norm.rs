//! Layer normalization.
//!
//! Normalizes over the last dimension with learned scale and shift:
//!
//! $$\text{LayerNorm}(x) = \frac{x - \mu}{\sqrt{\sigma^2 + \epsilon}} \cdot \gamma + \beta$$
//!
//! Half-precision models compute the statistics in f32 and cast the result
//! back, which keeps the variance from underflowing.

use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::Result;

/// LayerNorm weights and parameters.
pub struct LayerNorm {
    /// Learned scale gamma, shape `[width]`.
    pub weight: Tensor,

    /// Learned shift beta, shape `[width]`.
    pub bias: Tensor,

    pub eps: f64,

    /// Compute in f32 regardless of the parameter dtype.
    pub upcast: bool,
}

impl LayerNorm {
    pub fn new(width: usize, eps: f64, upcast: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(width, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(width, "bias", Init::Const(0.0))?;
        Ok(LayerNorm {
            weight,
            bias,
            eps,
            upcast,
        })
    }

    /// Apply LayerNorm to `[.., width]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dtype = x.dtype();
        let compute = if self.upcast { DType::F32 } else { in_dtype };
        let x = x.to_dtype(compute)?;

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let inv_std = var.affine(1.0, self.eps)?.sqrt()?.recip()?;
        let normalized = centered.broadcast_mul(&inv_std)?;

        let y = normalized
            .broadcast_mul(&self.weight.to_dtype(compute)?)?
            .broadcast_add(&self.bias.to_dtype(compute)?)?;
        Ok(y.to_dtype(in_dtype)?)
    }
}
