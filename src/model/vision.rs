//! Vision transformer tower.
//!
//! Cuts the image into square patches with a strided convolution, prepends a
//! class token, runs a pre-norm transformer and returns both the pooled
//! image latent (projected into the shared embedding space) and the
//! per-patch tokens used as cross-attention context by the decoder.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::{MammutError, Result};
use crate::flops::{self, OpKind};
use crate::model::config::{PoolType, VisionConfig};
use crate::model::embedding::PositionalEmbedding;
use crate::model::linear;
use crate::model::norm::LayerNorm;
use crate::model::transformer::{self, BlockSettings, Transformer};

/// The vision tower (`visual.*` parameters).
pub struct VisionTransformer {
    pub config: VisionConfig,

    /// Patch embedding kernel, shape `[width, 3, patch, patch]`.
    pub conv1: Tensor,

    /// Class token, shape `[width]`.
    pub class_embedding: Tensor,

    pub positional_embedding: PositionalEmbedding,

    pub ln_pre: LayerNorm,

    pub transformer: Transformer,

    pub ln_post: LayerNorm,

    /// Projection into the shared embedding space, shape `[width, embed_dim]`.
    pub proj: Tensor,
}

impl VisionTransformer {
    pub fn new(
        config: &VisionConfig,
        embed_dim: usize,
        quick_gelu: bool,
        upcast_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let width = config.width;
        let scale = (width as f64).powf(-0.5);
        let settings = BlockSettings {
            width,
            heads: config.heads(),
            mlp_width: config.mlp_width(),
            ls_init_value: config.ls_init_value,
            layer_norm_eps: config.layer_norm_eps,
            upcast_norm,
            activation: transformer::activation(quick_gelu),
        };

        let conv1 = vb.get_with_hints(
            (width, 3, config.patch_size, config.patch_size),
            "conv1.weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let class_embedding = vb.get_with_hints(
            width,
            "class_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: scale,
            },
        )?;
        let positional_embedding =
            PositionalEmbedding::new(config.num_patches() + 1, width, scale, vb.clone())?;
        let proj = vb.get_with_hints(
            (width, embed_dim),
            "proj",
            Init::Randn {
                mean: 0.0,
                stdev: scale,
            },
        )?;

        Ok(VisionTransformer {
            config: config.clone(),
            conv1,
            class_embedding,
            positional_embedding,
            ln_pre: LayerNorm::new(width, config.layer_norm_eps, upcast_norm, vb.pp("ln_pre"))?,
            transformer: Transformer::new(&settings, config.layers, vb.pp("transformer"))?,
            ln_post: LayerNorm::new(width, config.layer_norm_eps, upcast_norm, vb.pp("ln_post"))?,
            proj,
        })
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.transformer.grad_checkpointing = enable;
    }

    /// Encode a batch of images.
    ///
    /// # Arguments
    /// - `image`: Pixels `[batch, 3, image_size, image_size]`.
    ///
    /// # Returns
    /// `(image_latent [batch, embed_dim], image_embs [batch, num_patches, width])`.
    pub fn forward(&self, image: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, channels, height, width_px) = image.dims4()?;
        let size = self.config.image_size;
        if channels != 3 || height != size || width_px != size {
            return Err(MammutError::ShapeMismatch {
                expected: format!("[batch, 3, {size}, {size}]"),
                got: format!("{:?}", image.dims()),
            });
        }
        let image = image.to_dtype(self.conv1.dtype())?;
        let width = self.config.width;
        let patch = self.config.patch_size;
        let grid = self.config.grid_size();

        flops::record(
            OpKind::Conv2d,
            (batch * width * grid * grid * 3 * patch * patch) as u64,
            (batch * width * grid * grid) as u64,
        );
        let x = linear::conv2d(&image, &self.conv1, patch)?;

        // [batch, width, grid, grid] -> [batch, grid * grid, width]
        let x = x.reshape((batch, width, grid * grid))?.transpose(1, 2)?;
        let cls = self
            .class_embedding
            .reshape((1, 1, width))?
            .broadcast_as((batch, 1, width))?
            .contiguous()?;
        let x = Tensor::cat(&[&cls, &x.contiguous()?], 1)?;
        let x = self.positional_embedding.forward(&x)?;

        let x = self.ln_pre.forward(&x)?;
        let x = self.transformer.forward(&x, None)?;
        let x = self.ln_post.forward(&x)?;

        let num_patches = grid * grid;
        let tokens = x.narrow(1, 1, num_patches)?;
        let pooled = match self.config.pool_type {
            PoolType::Tok => x.narrow(1, 0, 1)?.squeeze(1)?,
            PoolType::Avg => tokens.mean(1)?,
        };
        let latent = linear::matmul_param(&pooled, &self.proj)?;
        Ok((latent, tokens))
    }
}
