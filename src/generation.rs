//! Autoregressive caption generation.
//!
//! The image is encoded once; each step re-runs the decoder over the whole
//! prefix (there is no KV cache) and samples the next token of every batch
//! row from the last position's logits.

use candle_core::{DType, Tensor};
use serde::Deserialize;

use crate::error::{MammutError, Result};
use crate::model::Mammut;
use crate::sampling::{Sampler, SamplingConfig};

/// Caption generation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Maximum sequence length including the start token. Capped at the
    /// model's context length.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// End-of-text is suppressed until a sequence reaches this length.
    #[serde(default = "default_min_seq_len")]
    pub min_seq_len: usize,

    #[serde(default = "default_sot")]
    pub sot_token_id: u32,

    #[serde(default = "default_eot")]
    pub eot_token_id: u32,

    /// Fills finished rows until the whole batch is done.
    #[serde(default)]
    pub pad_token_id: u32,

    #[serde(default)]
    pub sampling: SamplingConfig,
}

fn default_max_seq_len() -> usize {
    30
}
fn default_min_seq_len() -> usize {
    5
}
fn default_sot() -> u32 {
    49406
}
fn default_eot() -> u32 {
    49407
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_seq_len: default_max_seq_len(),
            min_seq_len: default_min_seq_len(),
            sot_token_id: default_sot(),
            eot_token_id: default_eot(),
            pad_token_id: 0,
            sampling: SamplingConfig::default(),
        }
    }
}

/// Generate token sequences for a batch of images.
///
/// Every returned sequence starts with `sot_token_id`; rows that emitted
/// `eot_token_id` are padded with `pad_token_id` so all rows have the same
/// length.
pub fn generate(model: &Mammut, image: &Tensor, config: &GenerationConfig) -> Result<Vec<Vec<u32>>> {
    let vocab_size = model.config.text_cfg.vocab_size;
    for (what, id) in [("sot", config.sot_token_id), ("eot", config.eot_token_id)] {
        if id as usize >= vocab_size {
            return Err(MammutError::InvalidInput(format!(
                "{what} token {id} outside vocabulary of {vocab_size}"
            )));
        }
    }
    let mut sampler = Sampler::new(config.sampling.clone())?;

    let (_, image_embs) = model.encode_image_with_tokens(image, true)?;
    let image_embs = model.map_image_embs(&image_embs)?;
    let batch = image_embs.dim(0)?;
    if batch == 0 {
        return Ok(Vec::new());
    }
    let max_len = config.max_seq_len.min(model.context_length);

    let mut seqs: Vec<Vec<u32>> = vec![vec![config.sot_token_id]; batch];
    let mut done = vec![false; batch];

    // All rows grow in lockstep, so they share one length.
    let mut len = 1;
    while len < max_len && done.iter().any(|d| !d) {
        let flat: Vec<u32> = seqs.iter().flatten().copied().collect();
        let input = Tensor::from_vec(flat, (batch, len), model.device())?;

        let logits = model.text_logits(&input, Some(&image_embs))?;
        let last = logits
            .narrow(1, len - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        for (b, mut row) in last.into_iter().enumerate() {
            if done[b] {
                seqs[b].push(config.pad_token_id);
                continue;
            }
            if len < config.min_seq_len {
                row[config.eot_token_id as usize] = f32::NEG_INFINITY;
            }
            let token = sampler.sample_with_history(&row, &seqs[b])? as u32;
            seqs[b].push(token);
            done[b] = token == config.eot_token_id;
        }
        tracing::trace!(step = len, finished = done.iter().filter(|d| **d).count(), "decode step");
        len += 1;
    }

    tracing::debug!(batch, len, "generation finished");
    Ok(seqs)
}
