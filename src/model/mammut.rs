//! The joint MaMMUT model.
//!
//! Composes the vision tower and the multimodal decoder:
//!
//! - contrastive branch: normalized image latent vs. normalized mean of the
//!   decoder's bidirectional text latents;
//! - generative branch: image tokens mapped into the decoder width by
//!   `map_viz2txt_kv` and used as cross-attention context for next-token
//!   prediction over the shifted text.
//!
//! All parameters live in one [`VarMap`]. Freezing a parameter removes it
//! from [`Mammut::trainable_vars`], the set handed to an optimizer.

use std::collections::BTreeSet;
use std::path::Path;

use candle_core::{Device, Shape, Tensor, Var, D};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::error::{MammutError, Result};
use crate::model::config::MammutConfig;
use crate::model::decoder::MultimodalDecoder;
use crate::model::linear;
use crate::model::vision::VisionTransformer;

/// Parameters that only serve the contrastive objective.
pub const CONTRASTIVE_ONLY_PARAMS: [&str; 6] = [
    "text.ln_final.weight",
    "text.ln_final.bias",
    "visual.proj",
    "visual.ln_post.weight",
    "visual.ln_post.bias",
    "logit_scale",
];

/// Inputs of a forward pass. Every field is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct MammutInputs<'a> {
    /// Pixels `[batch, 3, size, size]`.
    pub image: Option<&'a Tensor>,
    /// Token ids `[batch, len]`.
    pub text: Option<&'a Tensor>,
    /// Precomputed normalized image latent `[batch, embed_dim]`.
    pub image_latent: Option<&'a Tensor>,
    /// Precomputed vision tokens `[batch, tokens, vision_width]`.
    pub image_embs: Option<&'a Tensor>,
}

impl<'a> MammutInputs<'a> {
    pub fn new(image: &'a Tensor, text: &'a Tensor) -> Self {
        MammutInputs {
            image: Some(image),
            text: Some(text),
            ..Default::default()
        }
    }
}

/// Outputs of a forward pass.
#[derive(Debug, Clone)]
pub struct MammutOutput {
    /// `exp(logit_scale)`.
    pub logit_scale: Tensor,
    pub logit_bias: Option<Tensor>,
    /// Normalized image latent `[batch, embed_dim]`.
    pub image_features: Option<Tensor>,
    /// Normalized text latent `[batch, embed_dim]`; training with contrastive only.
    pub text_features: Option<Tensor>,
    /// Next-token logits `[batch, len, vocab]`.
    pub logits: Option<Tensor>,
    /// Targets `text[:, 1:]`.
    pub labels: Option<Tensor>,
}

/// MaMMUT: contrastive image-text encoder plus captioning decoder.
pub struct Mammut {
    pub config: MammutConfig,

    pub visual: VisionTransformer,

    pub text: MultimodalDecoder,

    /// Maps vision tokens to decoder keys/values, shape `[vision_width, text_width]`.
    pub map_viz2txt_kv: Tensor,

    /// Log of the contrastive temperature, scalar or `[1]`.
    pub logit_scale: Tensor,

    pub logit_bias: Option<Tensor>,

    pub pad_id: u32,

    pub context_length: usize,

    use_contrastive: bool,

    frozen: BTreeSet<String>,

    varmap: VarMap,

    device: Device,
}

impl Mammut {
    /// Build a freshly initialised model.
    pub fn new(config: MammutConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype(), device);
        Self::from_varbuilder(config, varmap, vb)
    }

    /// Build a model and load its parameters from a safetensors checkpoint.
    pub fn from_checkpoint(config: MammutConfig, path: &Path, device: &Device) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(path)?;
        Ok(model)
    }

    fn from_varbuilder(config: MammutConfig, varmap: VarMap, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let upcast = config.precision.is_half();

        let visual = VisionTransformer::new(
            &config.vision_cfg,
            config.embed_dim,
            config.quick_gelu,
            upcast,
            vb.pp("visual"),
        )?;
        let text = MultimodalDecoder::new(&config.text_cfg, config.quick_gelu, upcast, vb.pp("text"))?;

        let map_viz2txt_kv = vb.get_with_hints(
            (config.vision_cfg.width, config.text_cfg.width),
            "map_viz2txt_kv",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let logit_shape = Shape::from(config.logit_shape());
        let logit_scale = vb.get_with_hints(
            logit_shape.clone(),
            "logit_scale",
            Init::Const(config.init_logit_scale),
        )?;
        let logit_bias = config
            .init_logit_bias
            .map(|bias| vb.get_with_hints(logit_shape.clone(), "logit_bias", Init::Const(bias)))
            .transpose()?;

        tracing::debug!(
            params = config.estimated_params(),
            device = ?vb.device(),
            "built MaMMUT model"
        );

        Ok(Mammut {
            pad_id: config.pad_id,
            context_length: config.text_cfg.context_length,
            device: vb.device().clone(),
            config,
            visual,
            text,
            map_viz2txt_kv,
            logit_scale,
            logit_bias,
            use_contrastive: true,
            frozen: BTreeSet::new(),
            varmap,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.visual.set_grad_checkpointing(enable);
        self.text.set_grad_checkpointing(enable);
    }

    /// Encode text into the shared embedding space.
    ///
    /// Averages the decoder latents over the sequence and L2-normalizes
    /// them along the last dim when `normalize` is set.
    pub fn encode_text(&self, text: &Tensor, image_embs: Option<&Tensor>, normalize: bool) -> Result<Tensor> {
        let (_, latent) = self.text.forward(text, image_embs)?;
        let latent = latent.mean(1)?;
        if normalize {
            l2_normalize(&latent)
        } else {
            Ok(latent)
        }
    }

    /// Decoder token logits `[batch, len, vocab]`.
    ///
    /// `image_embs` must already be in the decoder width (see
    /// [`Mammut::map_image_embs`]).
    pub fn text_logits(&self, text: &Tensor, image_embs: Option<&Tensor>) -> Result<Tensor> {
        let (logits, _) = self.text.forward(text, image_embs)?;
        Ok(logits)
    }

    /// Image latent `[batch, embed_dim]`, L2-normalized when `normalize` is set.
    pub fn encode_image(&self, image: &Tensor, normalize: bool) -> Result<Tensor> {
        let (latent, _) = self.encode_image_with_tokens(image, normalize)?;
        Ok(latent)
    }

    /// Image latent together with the vision tokens.
    pub fn encode_image_with_tokens(&self, image: &Tensor, normalize: bool) -> Result<(Tensor, Tensor)> {
        let (latent, embs) = self.visual.forward(image)?;
        let latent = if normalize { l2_normalize(&latent)? } else { latent };
        Ok((latent, embs))
    }

    /// Project vision tokens into the decoder width for cross-attention.
    pub fn map_image_embs(&self, image_embs: &Tensor) -> Result<Tensor> {
        let embs = image_embs.to_dtype(self.map_viz2txt_kv.dtype())?;
        linear::matmul_param(&embs, &self.map_viz2txt_kv)
    }

    pub fn use_contrastive(&self) -> bool {
        self.use_contrastive
    }

    /// Enable or disable the contrastive objective.
    ///
    /// Disabling freezes the parameters only the contrastive objective
    /// trains ([`CONTRASTIVE_ONLY_PARAMS`]); enabling unfreezes them.
    pub fn set_use_contrastive(&mut self, used: bool) {
        self.use_contrastive = used;
        for name in CONTRASTIVE_ONLY_PARAMS {
            if used {
                self.frozen.remove(name);
            } else {
                self.frozen.insert(name.to_string());
            }
        }
        tracing::debug!(used, frozen = self.frozen.len(), "contrastive objective toggled");
    }

    /// Run the model.
    ///
    /// With `is_training`, the decoder input drops the last token (it has no
    /// label) and the contrastive text features are computed when the
    /// contrastive objective is enabled.
    pub fn forward(&self, inputs: &MammutInputs, is_training: bool) -> Result<MammutOutput> {
        let logit_scale = self.logit_scale.exp()?;

        let mut image_latent = inputs.image_latent.cloned();
        let mut image_embs = inputs.image_embs.cloned();
        if image_latent.is_none() || image_embs.is_none() {
            if let Some(image) = inputs.image {
                let (latent, embs) = self.encode_image_with_tokens(image, true)?;
                image_latent = Some(latent);
                image_embs = Some(embs);
            }
        }

        let mut out = MammutOutput {
            logit_scale,
            logit_bias: self.logit_bias.clone(),
            image_features: image_latent,
            text_features: None,
            logits: None,
            labels: None,
        };

        let Some(text) = inputs.text else {
            return Ok(out);
        };
        let (_, len) = text.dims2()?;
        if len < 2 {
            return Err(MammutError::InvalidInput(format!(
                "captioning needs at least 2 tokens per sequence, got {len}"
            )));
        }

        if is_training && self.use_contrastive {
            out.text_features = Some(self.encode_text(text, None, true)?);
        }

        let image_embs = image_embs.map(|e| self.map_image_embs(&e)).transpose()?;
        out.labels = Some(text.narrow(1, 1, len - 1)?);
        let decoder_input = if is_training {
            text.narrow(1, 0, len - 1)?
        } else {
            text.clone()
        };
        out.logits = Some(self.text_logits(&decoder_input, image_embs.as_ref())?);
        Ok(out)
    }

    // ── Parameters ──────────────────────────────────────────────────────

    /// All parameters, sorted by name.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Parameters an optimizer should update, sorted by name.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.named_vars()
            .into_iter()
            .filter(|(name, _)| !self.frozen.contains(name))
            .collect()
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen.contains(name)
    }

    /// Freeze (`requires_grad = false`) or unfreeze a parameter by name.
    pub fn set_requires_grad(&mut self, name: &str, requires_grad: bool) -> Result<()> {
        let exists = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name);
        if !exists {
            return Err(MammutError::WeightLoad(format!("parameter '{name}' not found")));
        }
        if requires_grad {
            self.frozen.remove(name);
        } else {
            self.frozen.insert(name.to_string());
        }
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.named_vars().iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Parameter count of one sub-module, e.g. `"visual"` or `"text"`.
    pub fn num_params_with_prefix(&self, prefix: &str) -> usize {
        let prefix = format!("{prefix}.");
        self.named_vars()
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(_, v)| v.elem_count())
            .sum()
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite the parameters with the tensors stored in a safetensors file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path).map_err(|e| {
            MammutError::WeightLoad(format!("failed to load {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "loaded weights");
        Ok(())
    }
}

/// L2-normalize along the last dim, guarding against zero vectors.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    Ok(x.broadcast_div(&norm)?)
}
