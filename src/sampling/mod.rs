//! Token sampling strategies for caption generation.
//!
//! Supports:
//! - Greedy (argmax), selected by a temperature of zero
//! - Temperature scaling
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Repetition penalty
//! - Deterministic seeded RNG for reproducible generation

use serde::Deserialize;
use thiserror::Error;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("empty logits row")]
    InvalidLogits,
    #[error("temperature must be >= 0, got {0}")]
    InvalidTemperature(f32),
    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Sampling hyperparameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingConfig {
    /// Softmax temperature. 0.0 selects greedy decoding.
    #[serde(default)]
    pub temperature: f32,

    /// Keep only the K most likely tokens. 0 = disabled.
    #[serde(default)]
    pub top_k: usize,

    /// Keep the smallest set whose cumulative probability reaches P. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Values > 1.0 discourage tokens already in the sequence.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_top_p() -> f32 {
    1.0
}
fn default_repetition_penalty() -> f32 {
    1.0
}
fn default_seed() -> u64 {
    42
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig::greedy()
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        SamplingConfig {
            temperature: 0.0,
            top_k: 0,
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            seed: default_seed(),
        }
    }

    /// Top-k sampling at the given temperature.
    pub fn top_k(k: usize, temperature: f32) -> Self {
        SamplingConfig {
            temperature,
            top_k: k,
            ..SamplingConfig::greedy()
        }
    }
}

/// Deterministic xorshift64 RNG for reproducible sampling.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Next float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Selects the next token from a row of logits.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: SeededRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> SamplingResult<Self> {
        if config.temperature < 0.0 || config.temperature.is_nan() {
            return Err(SamplingError::InvalidTemperature(config.temperature));
        }
        let rng = SeededRng::new(config.seed);
        Ok(Sampler { config, rng })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Sample a token index from logits.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        self.sample_with_history(logits, &[])
    }

    /// Sample with the tokens generated so far, for the repetition penalty.
    pub fn sample_with_history(&mut self, logits: &[f32], history: &[u32]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        let mut work = logits.to_vec();

        // Divide positive logits and multiply negative ones so a repeated
        // token always becomes less likely.
        let penalty = self.config.repetition_penalty;
        if (penalty - 1.0).abs() > f32::EPSILON {
            for &token in history {
                if let Some(logit) = work.get_mut(token as usize) {
                    if *logit > 0.0 {
                        *logit /= penalty;
                    } else {
                        *logit *= penalty;
                    }
                }
            }
        }

        if self.config.temperature == 0.0 {
            return argmax(&work).ok_or(SamplingError::NoValidTokens);
        }

        for logit in &mut work {
            *logit /= self.config.temperature;
        }
        if self.config.top_k > 0 {
            apply_top_k(&mut work, self.config.top_k);
        }
        let probs = softmax(&work);
        let probs = if self.config.top_p < 1.0 {
            apply_top_p(&probs, self.config.top_p)
        } else {
            probs
        };
        self.sample_from_distribution(&probs)
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }
        // Rounding left the cumulative sum short of r.
        probs
            .iter()
            .rposition(|&p| p > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

fn apply_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
    let mut sorted = probs.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut cumsum = 0.0;
    let mut cutoff = 0.0;
    for prob in sorted {
        cumsum += prob;
        cutoff = prob;
        if cumsum >= p {
            break;
        }
    }

    let mut result: Vec<f32> = probs
        .iter()
        .map(|&pr| if pr >= cutoff { pr } else { 0.0 })
        .collect();
    let sum: f32 = result.iter().sum();
    if sum > 0.0 {
        for pr in &mut result {
            *pr /= sum;
        }
    }
    result
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}
