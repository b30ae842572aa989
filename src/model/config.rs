//! MaMMUT model configuration.
//!
//! Hyperparameters for the vision tower, the multimodal text decoder and the
//! joint model. Configs are presets built in Rust (see [`super::registry`])
//! or JSON files using the same field names.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{MammutError, Result};

/// Pooling applied to the vision transformer output sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Class token is the pooled output, patch tokens are the image tokens.
    #[default]
    Tok,
    /// Mean of the patch tokens is the pooled output.
    Avg,
}

/// Parameter precision. Half precision layer norms run in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }

    /// Whether layer norms must upcast to f32.
    pub fn is_half(self) -> bool {
        !matches!(self, Precision::F32)
    }
}

/// Vision transformer tower configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Number of transformer blocks.
    #[serde(default = "default_vision_layers")]
    pub layers: usize,

    /// Hidden width of the tower.
    #[serde(default = "default_vision_width")]
    pub width: usize,

    /// Width of each attention head; `heads = width / head_width`.
    #[serde(default = "default_head_width")]
    pub head_width: usize,

    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    /// Side of the square patches cut by the patch embedding.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Side of the square input image.
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    /// Initial value of the per-channel layer scale. `None` disables it.
    #[serde(default)]
    pub ls_init_value: Option<f64>,

    #[serde(default)]
    pub pool_type: PoolType,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

/// Multimodal text decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultimodalConfig {
    /// Maximum number of tokens the decoder accepts.
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default = "default_text_width")]
    pub width: usize,

    #[serde(default = "default_text_heads")]
    pub heads: usize,

    #[serde(default = "default_text_layers")]
    pub layers: usize,

    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    #[serde(default)]
    pub ls_init_value: Option<f64>,

    /// Fraction of decoder layers followed by a cross-attention block.
    #[serde(default = "default_cross_attn_ratio")]
    pub cross_attn_ratio: f64,

    /// Spread cross-attention over the whole stack instead of only the top.
    #[serde(default = "default_true")]
    pub does_full_decoding: bool,

    /// Return per-token latents instead of only the last position.
    #[serde(default = "default_true")]
    pub output_tokens: bool,

    /// Whether residual blocks carry an MLP after attention.
    #[serde(default = "default_true")]
    pub has_mlp: bool,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

/// Configuration of the joint MaMMUT model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MammutConfig {
    /// Dimension of the shared contrastive embedding space.
    pub embed_dim: usize,

    #[serde(alias = "vision")]
    pub vision_cfg: VisionConfig,

    #[serde(alias = "text")]
    pub text_cfg: MultimodalConfig,

    /// Use `x * sigmoid(1.702 x)` instead of exact GELU.
    #[serde(default)]
    pub quick_gelu: bool,

    #[serde(default)]
    pub precision: Precision,

    /// Token id used for padding; ignored by the captioning labels.
    #[serde(default)]
    pub pad_id: u32,

    /// Initial value of the (log) contrastive temperature.
    #[serde(default = "default_init_logit_scale")]
    pub init_logit_scale: f64,

    #[serde(default)]
    pub init_logit_bias: Option<f64>,

    /// Store the logit scale (and bias) as shape `[1]` instead of a scalar.
    #[serde(default)]
    pub nonscalar_logit_scale: bool,
}

fn default_vision_layers() -> usize {
    12
}
fn default_vision_width() -> usize {
    768
}
fn default_head_width() -> usize {
    64
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_patch_size() -> usize {
    16
}
fn default_image_size() -> usize {
    224
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_context_length() -> usize {
    77
}
fn default_vocab_size() -> usize {
    49408
}
fn default_text_width() -> usize {
    512
}
fn default_text_heads() -> usize {
    8
}
fn default_text_layers() -> usize {
    12
}
fn default_cross_attn_ratio() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_init_logit_scale() -> f64 {
    (1.0f64 / 0.07).ln()
}

impl Default for VisionConfig {
    fn default() -> Self {
        VisionConfig {
            layers: default_vision_layers(),
            width: default_vision_width(),
            head_width: default_head_width(),
            mlp_ratio: default_mlp_ratio(),
            patch_size: default_patch_size(),
            image_size: default_image_size(),
            ls_init_value: None,
            pool_type: PoolType::Tok,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        MultimodalConfig {
            context_length: default_context_length(),
            vocab_size: default_vocab_size(),
            width: default_text_width(),
            heads: default_text_heads(),
            layers: default_text_layers(),
            mlp_ratio: default_mlp_ratio(),
            ls_init_value: None,
            cross_attn_ratio: default_cross_attn_ratio(),
            does_full_decoding: true,
            output_tokens: true,
            has_mlp: true,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl VisionConfig {
    pub fn heads(&self) -> usize {
        self.width / self.head_width
    }

    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    pub fn mlp_width(&self) -> usize {
        (self.width as f64 * self.mlp_ratio) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.head_width == 0 || self.width % self.head_width != 0 {
            return Err(MammutError::Config(format!(
                "vision width {} is not divisible by head width {}",
                self.width, self.head_width
            )));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(MammutError::Config(format!(
                "image size {} is not divisible by patch size {}",
                self.image_size, self.patch_size
            )));
        }
        Ok(())
    }
}

impl MultimodalConfig {
    pub fn mlp_width(&self) -> usize {
        (self.width as f64 * self.mlp_ratio) as usize
    }

    /// Number of decoder layers followed by a cross-attention block.
    pub fn cross_attn_layers(&self) -> usize {
        let n = (self.layers as f64 * self.cross_attn_ratio).round();
        (n.max(0.0) as usize).min(self.layers)
    }

    /// Indices of the self-attention layers after which cross-attention runs.
    ///
    /// Full decoding spreads the blocks evenly so that the last layer always
    /// cross-attends; otherwise they occupy the top of the stack.
    pub fn cross_attn_positions(&self) -> Vec<usize> {
        let n = self.cross_attn_layers();
        if n == 0 {
            return Vec::new();
        }
        if self.does_full_decoding {
            (1..=n).map(|j| j * self.layers / n - 1).collect()
        } else {
            (self.layers - n..self.layers).collect()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.heads == 0 || self.width % self.heads != 0 {
            return Err(MammutError::Config(format!(
                "text width {} is not divisible by {} heads",
                self.width, self.heads
            )));
        }
        if self.context_length == 0 {
            return Err(MammutError::Config("context length must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.cross_attn_ratio) {
            return Err(MammutError::Config(format!(
                "cross attention ratio {} outside [0, 1]",
                self.cross_attn_ratio
            )));
        }
        Ok(())
    }
}

// Parameter counts of the building blocks, shared by the estimate below.
fn layer_norm_params(w: usize) -> usize {
    2 * w
}
fn attention_params(w: usize) -> usize {
    4 * w * w + 4 * w
}
fn mlp_params(w: usize, hidden: usize) -> usize {
    2 * w * hidden + hidden + w
}

impl MammutConfig {
    /// Check cross-field constraints the towers rely on.
    pub fn validate(&self) -> Result<()> {
        self.vision_cfg.validate()?;
        self.text_cfg.validate()?;
        if self.text_cfg.width != self.embed_dim {
            return Err(MammutError::Config(format!(
                "text width {} must equal embed_dim {} for contrastive text latents",
                self.text_cfg.width, self.embed_dim
            )));
        }
        Ok(())
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// Shape of the logit scale and bias parameters.
    pub fn logit_shape(&self) -> Vec<usize> {
        if self.nonscalar_logit_scale {
            vec![1]
        } else {
            Vec::new()
        }
    }

    /// Exact parameter count of the vision tower.
    pub fn vision_params(&self) -> usize {
        let v = &self.vision_cfg;
        let w = v.width;
        let ls = if v.ls_init_value.is_some() { 2 * w } else { 0 };
        let block = 2 * layer_norm_params(w) + attention_params(w) + mlp_params(w, v.mlp_width()) + ls;
        let patch = w * 3 * v.patch_size * v.patch_size;
        let embeddings = w + (v.num_patches() + 1) * w;
        patch + embeddings + 2 * layer_norm_params(w) + v.layers * block + w * self.embed_dim
    }

    /// Exact parameter count of the multimodal decoder.
    pub fn text_params(&self) -> usize {
        let t = &self.text_cfg;
        let w = t.width;
        let ls = if t.ls_init_value.is_some() { w } else { 0 };
        let mlp_part = if t.has_mlp {
            layer_norm_params(w) + mlp_params(w, t.mlp_width()) + ls
        } else {
            0
        };
        let self_block = layer_norm_params(w) + attention_params(w) + ls + mlp_part;
        let cross_block = 2 * layer_norm_params(w) + attention_params(w) + ls + mlp_part;
        let embeddings = t.vocab_size * w + t.context_length * w;
        embeddings
            + t.layers * self_block
            + t.cross_attn_layers() * cross_block
            + layer_norm_params(w)
            + w * t.vocab_size
    }

    /// Exact parameter count of the full model.
    pub fn estimated_params(&self) -> usize {
        // Scalar and `[1]` logit parameters both hold a single element.
        let bias = usize::from(self.init_logit_bias.is_some());
        self.vision_params()
            + self.text_params()
            + self.vision_cfg.width * self.text_cfg.width
            + 1
            + bias
    }

    /// Estimated weight memory in bytes at the configured precision.
    pub fn estimated_memory_bytes(&self) -> usize {
        self.estimated_params() * self.dtype().size_in_bytes()
    }
}
