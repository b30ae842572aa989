//! Linear layers.
//!
//! Standard linear layers perform `y = x @ W^T + b`. Every projection is
//! reported to the op counter so profiles see the real shapes.
//!
//! candle's CPU backend has no BF16 gemm, so BF16 products on the CPU run
//! in f32 and are cast back.

use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::Result;
use crate::flops::{self, OpKind};

/// Standard deviation used for projection weights.
pub const PROJ_INIT_STD: f64 = 0.02;

/// Full-precision linear layer.
pub struct Linear {
    /// Weight matrix, shape `[out_features, in_features]`.
    pub weight: Tensor,

    /// Optional bias, shape `[out_features]`.
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Linear { weight, bias }
    }

    /// Create a layer with `weight` and `bias` parameters under `vb`.
    pub fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: PROJ_INIT_STD,
            },
        )?;
        let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;
        Ok(Linear::new(weight, Some(bias)))
    }

    /// Forward pass: `y = x @ W^T [+ b]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        project(x, &self.weight, self.bias.as_ref())
    }
}

/// `x @ weight^T + bias` over the last dim of `x`, recorded as a linear op.
pub fn project(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    let rows = x.elem_count() / in_features.max(1);
    flops::record_matmul(OpKind::Linear, 1, rows, in_features, out_features);

    let y = broadcast_matmul(x, &weight.t()?)?;
    match bias {
        Some(b) => Ok(y.broadcast_add(b)?),
        None => Ok(y),
    }
}

/// `x @ matrix` for a `[in, out]` parameter matrix, recorded as a matmul.
pub fn matmul_param(x: &Tensor, matrix: &Tensor) -> Result<Tensor> {
    let (in_features, out_features) = matrix.dims2()?;
    let rows = x.elem_count() / x.dim(D::Minus1)?.max(1);
    flops::record_matmul(OpKind::Matmul, 1, rows, in_features, out_features);
    broadcast_matmul(x, matrix)
}

/// Whether products on `t` must be computed in f32.
pub(crate) fn needs_upcast(t: &Tensor) -> bool {
    t.dtype() == DType::BF16 && t.device().is_cpu()
}

fn upcast_binary(
    a: &Tensor,
    b: &Tensor,
    op: impl Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
) -> Result<Tensor> {
    if needs_upcast(a) || needs_upcast(b) {
        let out_dtype = a.dtype();
        let y = op(&a.to_dtype(DType::F32)?, &b.to_dtype(DType::F32)?)?;
        Ok(y.to_dtype(out_dtype)?)
    } else {
        Ok(op(a, b)?)
    }
}

/// `a @ b` with matching batch dims.
pub(crate) fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    upcast_binary(a, b, |a, b| a.matmul(b))
}

/// `a @ b`, broadcasting the batch dims of `b`.
pub(crate) fn broadcast_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    upcast_binary(a, b, |a, b| a.broadcast_matmul(b))
}

/// Convolution of `image` with `kernel`, no padding, dilation 1, one group.
pub(crate) fn conv2d(image: &Tensor, kernel: &Tensor, stride: usize) -> Result<Tensor> {
    upcast_binary(image, kernel, |x, k| x.conv2d(k, 0, stride, 1, 1))
}
