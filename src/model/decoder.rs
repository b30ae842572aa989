//! Multimodal text decoder.
//!
//! A single transformer plays two roles:
//! - contrastive text encoder: bidirectional self-attention, no image input,
//!   cross-attention blocks skipped;
//! - captioning decoder: causal self-attention with cross-attention blocks
//!   reading the image tokens.
//!
//! The same weights produce the contrastive text latent and next-token
//! logits over the vocabulary.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::{MammutError, Result};
use crate::model::attention::causal_mask;
use crate::model::config::MultimodalConfig;
use crate::model::embedding::{PositionalEmbedding, TokenEmbedding};
use crate::model::linear;
use crate::model::norm::LayerNorm;
use crate::model::transformer::{self, BlockSettings, CrossAttentionBlock, ResidualBlock};

/// The text tower (`text.*` parameters).
pub struct MultimodalDecoder {
    pub config: MultimodalConfig,

    pub token_embedding: TokenEmbedding,

    pub positional_embedding: PositionalEmbedding,

    /// Self-attention blocks, one per layer.
    pub resblocks: Vec<ResidualBlock>,

    /// Cross-attention blocks, one per entry of `cross_attn_after`.
    pub cross_attn: Vec<CrossAttentionBlock>,

    /// Self-attention layer index each cross-attention block follows.
    pub cross_attn_after: Vec<usize>,

    pub ln_final: LayerNorm,

    /// Vocabulary head, shape `[width, vocab_size]`.
    pub text_projection: Tensor,

    /// Recorded request for activation checkpointing.
    pub grad_checkpointing: bool,
}

impl MultimodalDecoder {
    pub fn new(
        config: &MultimodalConfig,
        quick_gelu: bool,
        upcast_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let width = config.width;
        let settings = BlockSettings {
            width,
            heads: config.heads,
            mlp_width: config.mlp_width(),
            ls_init_value: config.ls_init_value,
            layer_norm_eps: config.layer_norm_eps,
            upcast_norm,
            activation: transformer::activation(quick_gelu),
        };

        let resblocks_vb = vb.pp("resblocks");
        let resblocks = (0..config.layers)
            .map(|i| ResidualBlock::new(&settings, config.has_mlp, resblocks_vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let cross_attn_after = config.cross_attn_positions();
        let cross_vb = vb.pp("cross_attn");
        let cross_attn = (0..cross_attn_after.len())
            .map(|j| CrossAttentionBlock::new(&settings, config.has_mlp, cross_vb.pp(j.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let text_projection = vb.get_with_hints(
            (width, config.vocab_size),
            "text_projection",
            Init::Randn {
                mean: 0.0,
                stdev: (width as f64).powf(-0.5),
            },
        )?;

        Ok(MultimodalDecoder {
            config: config.clone(),
            token_embedding: TokenEmbedding::new(
                config.vocab_size,
                width,
                vb.pp("token_embedding"),
            )?,
            positional_embedding: PositionalEmbedding::new(
                config.context_length,
                width,
                0.01,
                vb.clone(),
            )?,
            resblocks,
            cross_attn,
            cross_attn_after,
            ln_final: LayerNorm::new(width, config.layer_norm_eps, upcast_norm, vb.pp("ln_final"))?,
            text_projection,
            grad_checkpointing: false,
        })
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.grad_checkpointing = enable;
    }

    pub fn context_length(&self) -> usize {
        self.config.context_length
    }

    /// Run the decoder.
    ///
    /// # Arguments
    /// - `text`: Token ids `[batch, len]`, `len <= context_length`.
    /// - `image_embs`: Image tokens already mapped to the decoder width,
    ///   `[batch, tokens, width]`. `None` runs the contrastive text encoder.
    ///
    /// # Returns
    /// `(token_logits [batch, len, vocab], text_latent)`, where `text_latent`
    /// is `[batch, len, width]`, or `[batch, 1, width]` when the decoder does
    /// not output tokens.
    pub fn forward(&self, text: &Tensor, image_embs: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (_, seq_len) = text.dims2()?;
        if seq_len == 0 || seq_len > self.context_length() {
            return Err(MammutError::ShapeMismatch {
                expected: format!("1..={} tokens", self.context_length()),
                got: seq_len.to_string(),
            });
        }

        let x = self.token_embedding.forward(text)?;
        let mut x = self.positional_embedding.forward(&x)?;

        let mask = match image_embs {
            Some(_) => Some(causal_mask(seq_len, x.dtype(), x.device())?),
            None => None,
        };
        let image_embs = match image_embs {
            Some(e) => Some(e.to_dtype(x.dtype())?),
            None => None,
        };

        let mut cross = self.cross_attn_after.iter().zip(&self.cross_attn).peekable();
        for (i, block) in self.resblocks.iter().enumerate() {
            x = block.forward(&x, mask.as_ref())?;
            while let Some((_, cross_block)) = cross.next_if(|(after, _)| **after == i) {
                if let Some(embs) = &image_embs {
                    x = cross_block.forward(&x, embs)?;
                }
            }
        }

        let latent = self.ln_final.forward(&x)?;
        let logits = linear::matmul_param(&latent, &self.text_projection)?;
        let latent = if self.config.output_tokens {
            latent
        } else {
            latent.narrow(1, seq_len - 1, 1)?
        };
        Ok((logits, latent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny() -> MultimodalConfig {
        MultimodalConfig {
            context_length: 6,
            vocab_size: 20,
            width: 8,
            heads: 2,
            layers: 2,
            ..MultimodalConfig::default()
        }
    }

    fn decoder(config: &MultimodalConfig) -> MultimodalDecoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MultimodalDecoder::new(config, false, false, vb).unwrap()
    }

    fn tokens(batch: usize, len: usize) -> Tensor {
        Tensor::ones((batch, len), DType::U32, &Device::Cpu).unwrap()
    }

    #[test]
    fn logits_cover_vocab() {
        let dec = decoder(&tiny());
        let (logits, latent) = dec.forward(&tokens(2, 4), None).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 20]);
        assert_eq!(latent.dims(), &[2, 4, 8]);
    }

    #[test]
    fn image_context_changes_logits() {
        let dec = decoder(&tiny());
        let embs = Tensor::randn(0f32, 1., (1, 3, 8), &Device::Cpu).unwrap();
        let (with_image, _) = dec.forward(&tokens(1, 3), Some(&embs)).unwrap();
        let (without, _) = dec.forward(&tokens(1, 3), None).unwrap();
        let diff = (with_image - without)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn last_token_latent_without_output_tokens() {
        let cfg = MultimodalConfig {
            output_tokens: false,
            ..tiny()
        };
        let dec = decoder(&cfg);
        let (_, latent) = dec.forward(&tokens(2, 5), None).unwrap();
        assert_eq!(latent.dims(), &[2, 1, 8]);
    }

    #[test]
    fn rejects_text_longer_than_context() {
        let dec = decoder(&tiny());
        assert!(matches!(
            dec.forward(&tokens(1, 7), None),
            Err(MammutError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn without_mlp_builds_and_runs() {
        let cfg = MultimodalConfig {
            has_mlp: false,
            ..tiny()
        };
        let dec = decoder(&cfg);
        assert!(dec.resblocks.iter().all(|b| b.mlp.is_none()));
        let (logits, _) = dec.forward(&tokens(1, 2), None).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 20]);
    }

    fn first_position(t: &Tensor) -> Vec<f32> {
        t.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn text_encoding_sees_later_tokens() {
        let dec = decoder(&tiny());
        let a = Tensor::new(&[[3u32, 5, 7, 9]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 5, 7, 11]], &Device::Cpu).unwrap();
        let (_, latent_a) = dec.forward(&a, None).unwrap();
        let (_, latent_b) = dec.forward(&b, None).unwrap();
        assert_eq!(latent_a.dims(), &[1, 4, 8]);
        assert!(max_abs_diff(&first_position(&latent_a), &first_position(&latent_b)) > 1e-4);
    }

    #[test]
    fn captioning_is_causal() {
        let dec = decoder(&tiny());
        let embs = Tensor::randn(0f32, 1., (1, 3, 8), &Device::Cpu).unwrap();
        let a = Tensor::new(&[[3u32, 5, 7, 9]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 5, 7, 11]], &Device::Cpu).unwrap();
        let (logits_a, _) = dec.forward(&a, Some(&embs)).unwrap();
        let (logits_b, _) = dec.forward(&b, Some(&embs)).unwrap();
        assert!(max_abs_diff(&first_position(&logits_a), &first_position(&logits_b)) < 1e-5);

        let last = |t: &Tensor| t.narrow(1, 3, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(max_abs_diff(&last(&logits_a), &last(&logits_b)) > 1e-4);
    }
}
