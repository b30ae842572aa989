//! Multi-head attention.
//!
//! One layer type serves both attention flavours of the model:
//! self-attention (queries, keys and values from the same sequence, with an
//! optional additive mask) and cross-attention (keys and values from the
//! image tokens). The packed `in_proj` layout keeps Q, K and V projections
//! in a single `[3 * width, width]` matrix.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{MammutError, Result};
use crate::flops::{self, OpKind};
use crate::model::linear::{self, Linear};

/// Multi-head attention layer.
pub struct Attention {
    /// Packed Q/K/V projection, shape `[3 * width, width]`.
    pub in_proj_weight: Tensor,

    /// Packed Q/K/V bias, shape `[3 * width]`.
    pub in_proj_bias: Tensor,

    /// Output projection: `[width] -> [width]`.
    pub out_proj: Linear,

    pub n_heads: usize,

    pub head_dim: usize,

    /// Attention scale factor: 1 / sqrt(head_dim).
    pub scale: f64,
}

impl Attention {
    pub fn new(width: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        if n_heads == 0 || width % n_heads != 0 {
            return Err(MammutError::Config(format!(
                "attention width {width} is not divisible by {n_heads} heads"
            )));
        }
        let in_proj_weight = vb.get_with_hints(
            (3 * width, width),
            "in_proj_weight",
            Init::Randn {
                mean: 0.0,
                stdev: (width as f64).powf(-0.5),
            },
        )?;
        let in_proj_bias = vb.get_with_hints(3 * width, "in_proj_bias", Init::Const(0.0))?;
        let out_proj = Linear::load(width, width, vb.pp("out_proj"))?;
        let head_dim = width / n_heads;
        Ok(Attention {
            in_proj_weight,
            in_proj_bias,
            out_proj,
            n_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn width(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Queries `[batch, q_len, width]`.
    /// - `kv`: Keys/values source `[batch, kv_len, width]`; `None` for self-attention.
    /// - `mask`: Optional additive mask broadcastable to `[batch, heads, q_len, kv_len]`.
    ///
    /// # Returns
    /// Output tensor `[batch, q_len, width]`.
    pub fn forward(&self, x: &Tensor, kv: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, q_len, _) = x.dims3()?;
        let w = self.width();

        let (q, k, v) = match kv {
            None => {
                let qkv = linear::project(x, &self.in_proj_weight, Some(&self.in_proj_bias))?;
                (qkv.narrow(2, 0, w)?, qkv.narrow(2, w, w)?, qkv.narrow(2, 2 * w, w)?)
            }
            Some(kv) => {
                let q = linear::project(
                    x,
                    &self.in_proj_weight.narrow(0, 0, w)?,
                    Some(&self.in_proj_bias.narrow(0, 0, w)?),
                )?;
                let kv = linear::project(
                    kv,
                    &self.in_proj_weight.narrow(0, w, 2 * w)?,
                    Some(&self.in_proj_bias.narrow(0, w, 2 * w)?),
                )?;
                (q, kv.narrow(2, 0, w)?, kv.narrow(2, w, w)?)
            }
        };
        let kv_len = k.dim(1)?;

        // [batch, len, width] -> [batch, heads, len, head_dim]
        let q = self.split_heads(&q, batch, q_len)?;
        let k = self.split_heads(&k, batch, kv_len)?;
        let v = self.split_heads(&v, batch, kv_len)?;

        let bh = batch * self.n_heads;
        flops::record_matmul(OpKind::AttentionScores, bh, q_len, self.head_dim, kv_len);
        let scores = linear::matmul(&q, &k.t()?.contiguous()?)?.affine(self.scale, 0.0)?;
        let scores = match mask {
            Some(m) => scores.broadcast_add(m)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        flops::record_matmul(OpKind::AttentionValues, bh, q_len, kv_len, self.head_dim);
        let out = linear::matmul(&weights, &v)?;

        // Merge heads: [batch, q_len, width]
        let out = out.transpose(1, 2)?.reshape((batch, q_len, w))?;
        self.out_proj.forward(&out)
    }

    fn split_heads(&self, t: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        Ok(t.reshape((batch, len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// Additive causal mask `[len, len]`: 0 on and below the diagonal, -inf above.
pub fn causal_mask(len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(data, (len, len), device)?.to_dtype(dtype)?)
}
