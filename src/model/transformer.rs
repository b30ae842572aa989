//! Transformer building blocks shared by both towers.
//!
//! Every block is pre-norm with residual connections and an optional
//! per-channel layer scale on each residual branch:
//!
//! 1. LayerNorm -> attention -> (layer scale) -> residual
//! 2. LayerNorm -> MLP -> (layer scale) -> residual

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::Result;
use crate::model::attention::Attention;
use crate::model::linear::Linear;
use crate::model::norm::LayerNorm;

/// Settings shared by all blocks of one tower.
#[derive(Debug, Clone, Copy)]
pub struct BlockSettings {
    pub width: usize,
    pub heads: usize,
    pub mlp_width: usize,
    pub ls_init_value: Option<f64>,
    pub layer_norm_eps: f64,
    /// Run layer norms in f32 (half precision models).
    pub upcast_norm: bool,
    pub activation: MlpActivation,
}

impl BlockSettings {
    fn norm(&self, vb: VarBuilder) -> Result<LayerNorm> {
        LayerNorm::new(self.width, self.layer_norm_eps, self.upcast_norm, vb)
    }
}

/// Activation used by a tower's MLPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlpActivation {
    /// Exact (erf) GELU.
    Gelu,
    /// `x * sigmoid(1.702 x)`.
    QuickGelu,
}

impl MlpActivation {
    pub fn forward(self, x: &Tensor) -> Result<Tensor> {
        match self {
            MlpActivation::Gelu => Ok(x.gelu_erf()?),
            MlpActivation::QuickGelu => quick_gelu(x),
        }
    }
}

/// QuickGELU activation: x * sigmoid(1.702 * x)
fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    let gate = candle_nn::ops::sigmoid(&x.affine(1.702, 0.0)?)?;
    Ok(x.mul(&gate)?)
}

pub fn activation(quick_gelu: bool) -> MlpActivation {
    if quick_gelu {
        MlpActivation::QuickGelu
    } else {
        MlpActivation::Gelu
    }
}

/// Learned per-channel scaling of a residual branch.
pub struct LayerScale {
    pub gamma: Tensor,
}

impl LayerScale {
    pub fn new(width: usize, init: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(width, "gamma", Init::Const(init))?;
        Ok(LayerScale { gamma })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_mul(&self.gamma)?)
    }
}

fn layer_scale(settings: &BlockSettings, vb: VarBuilder) -> Result<Option<LayerScale>> {
    settings
        .ls_init_value
        .map(|init| LayerScale::new(settings.width, init, vb))
        .transpose()
}

fn scaled(ls: &Option<LayerScale>, x: Tensor) -> Result<Tensor> {
    match ls {
        Some(ls) => ls.forward(&x),
        None => Ok(x),
    }
}

/// Two-layer feed-forward network: `c_fc -> act -> c_proj`.
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    pub activation: MlpActivation,
}

impl Mlp {
    pub fn new(settings: &BlockSettings, vb: VarBuilder) -> Result<Self> {
        Ok(Mlp {
            c_fc: Linear::load(settings.width, settings.mlp_width, vb.pp("c_fc"))?,
            c_proj: Linear::load(settings.mlp_width, settings.width, vb.pp("c_proj"))?,
            activation: settings.activation,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?;
        let h = self.activation.forward(&h)?;
        self.c_proj.forward(&h)
    }
}

/// Pre-norm MLP branch with its residual connection.
pub struct MlpBranch {
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
    pub ls_2: Option<LayerScale>,
}

impl MlpBranch {
    fn new(settings: &BlockSettings, vb: &VarBuilder) -> Result<Self> {
        Ok(MlpBranch {
            ln_2: settings.norm(vb.pp("ln_2"))?,
            mlp: Mlp::new(settings, vb.pp("mlp"))?,
            ls_2: layer_scale(settings, vb.pp("ls_2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.mlp.forward(&self.ln_2.forward(x)?)?;
        Ok((x + scaled(&self.ls_2, h)?)?)
    }
}

/// Self-attention residual block.
pub struct ResidualBlock {
    pub ln_1: LayerNorm,
    pub attn: Attention,
    pub ls_1: Option<LayerScale>,
    /// Absent when the tower is configured without MLPs.
    pub mlp: Option<MlpBranch>,
}

impl ResidualBlock {
    pub fn new(settings: &BlockSettings, has_mlp: bool, vb: VarBuilder) -> Result<Self> {
        Ok(ResidualBlock {
            ln_1: settings.norm(vb.pp("ln_1"))?,
            attn: Attention::new(settings.width, settings.heads, vb.pp("attn"))?,
            ls_1: layer_scale(settings, vb.pp("ls_1"))?,
            mlp: if has_mlp {
                Some(MlpBranch::new(settings, &vb)?)
            } else {
                None
            },
        })
    }

    /// Forward pass over `[batch, len, width]` with an optional additive mask.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h = self.attn.forward(&self.ln_1.forward(x)?, None, mask)?;
        let x = (x + scaled(&self.ls_1, h)?)?;
        match &self.mlp {
            Some(mlp) => mlp.forward(&x),
            None => Ok(x),
        }
    }
}

/// Cross-attention residual block: text queries attend to image tokens.
pub struct CrossAttentionBlock {
    pub ln_1: LayerNorm,
    /// Normalizes the image tokens before they become keys and values.
    pub ln_1_kv: LayerNorm,
    pub attn: Attention,
    pub ls_1: Option<LayerScale>,
    pub mlp: Option<MlpBranch>,
}

impl CrossAttentionBlock {
    pub fn new(settings: &BlockSettings, has_mlp: bool, vb: VarBuilder) -> Result<Self> {
        Ok(CrossAttentionBlock {
            ln_1: settings.norm(vb.pp("ln_1"))?,
            ln_1_kv: settings.norm(vb.pp("ln_1_kv"))?,
            attn: Attention::new(settings.width, settings.heads, vb.pp("attn"))?,
            ls_1: layer_scale(settings, vb.pp("ls_1"))?,
            mlp: if has_mlp {
                Some(MlpBranch::new(settings, &vb)?)
            } else {
                None
            },
        })
    }

    /// `x`: text states `[batch, len, width]`; `image_embs`: `[batch, tokens, width]`.
    pub fn forward(&self, x: &Tensor, image_embs: &Tensor) -> Result<Tensor> {
        let q = self.ln_1.forward(x)?;
        let kv = self.ln_1_kv.forward(image_embs)?;
        let h = self.attn.forward(&q, Some(&kv), None)?;
        let x = (x + scaled(&self.ls_1, h)?)?;
        match &self.mlp {
            Some(mlp) => mlp.forward(&x),
            None => Ok(x),
        }
    }
}

/// A plain stack of self-attention blocks.
pub struct Transformer {
    pub resblocks: Vec<ResidualBlock>,
    /// Recorded request for activation checkpointing.
    pub grad_checkpointing: bool,
}

impl Transformer {
    pub fn new(settings: &BlockSettings, layers: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("resblocks");
        let resblocks = (0..layers)
            .map(|i| ResidualBlock::new(settings, true, vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Transformer {
            resblocks,
            grad_checkpointing: false,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.resblocks {
            h = block.forward(&h, mask)?;
        }
        Ok(h)
    }
}
