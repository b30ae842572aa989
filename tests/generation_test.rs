//! Tests for caption generation on the tiny preset.

use candle_core::{Device, Tensor};
use mammut::generation::{generate, GenerationConfig};
use mammut::model::registry::tiny;
use mammut::sampling::SamplingConfig;
use mammut::{Mammut, MammutError};

const SOT: u32 = 1;
const EOT: u32 = 2;
const PAD: u32 = 0;

fn setup() -> (Mammut, Tensor) {
    let model = Mammut::new(tiny(), &Device::Cpu).unwrap();
    let image = Tensor::randn(0f32, 1.0, (3, 3, 32, 32), &Device::Cpu).unwrap();
    (model, image)
}

fn config(sampling: SamplingConfig) -> GenerationConfig {
    GenerationConfig {
        max_seq_len: 10,
        min_seq_len: 4,
        sot_token_id: SOT,
        eot_token_id: EOT,
        pad_token_id: PAD,
        sampling,
    }
}

fn check_sequences(seqs: &[Vec<u32>], max_len: usize, min_len: usize) {
    assert_eq!(seqs.len(), 3);
    let len = seqs[0].len();
    assert!(len >= 2 && len <= max_len, "len {len}");
    for seq in seqs {
        assert_eq!(seq.len(), len);
        assert_eq!(seq[0], SOT);
        assert!(seq.iter().all(|&t| t < 64));
        if let Some(pos) = seq.iter().position(|&t| t == EOT) {
            assert!(pos >= min_len, "eot at {pos}");
            assert!(seq[pos + 1..].iter().all(|&t| t == PAD));
        }
    }
}

#[test]
fn test_greedy_generation() {
    let (model, image) = setup();
    let seqs = generate(&model, &image, &config(SamplingConfig::greedy())).unwrap();
    check_sequences(&seqs, 10, 4);
}

#[test]
fn test_greedy_is_deterministic() {
    let (model, image) = setup();
    let cfg = config(SamplingConfig::greedy());
    assert_eq!(generate(&model, &image, &cfg).unwrap(), generate(&model, &image, &cfg).unwrap());
}

#[test]
fn test_sampled_generation() {
    let (model, image) = setup();
    let sampling = SamplingConfig {
        temperature: 0.8,
        top_k: 10,
        top_p: 0.9,
        repetition_penalty: 1.2,
        seed: 3,
    };
    let seqs = generate(&model, &image, &config(sampling)).unwrap();
    check_sequences(&seqs, 10, 4);
}

#[test]
fn test_length_capped_by_context() {
    let (model, image) = setup();
    let cfg = GenerationConfig {
        max_seq_len: 100,
        ..config(SamplingConfig::greedy())
    };
    let seqs = generate(&model, &image, &cfg).unwrap();
    assert!(seqs[0].len() <= tiny().text_cfg.context_length);
}

#[test]
fn test_special_tokens_must_be_in_vocab() {
    let (model, image) = setup();
    let cfg = GenerationConfig {
        sot_token_id: 64,
        ..config(SamplingConfig::greedy())
    };
    let err = generate(&model, &image, &cfg).unwrap_err();
    assert!(matches!(err, MammutError::InvalidInput(_)));
}

#[test]
fn test_empty_batch_generates_nothing() {
    let (model, _) = setup();
    let empty = Tensor::zeros((0, 3, 32, 32), candle_core::DType::F32, &Device::Cpu).unwrap();
    let seqs = generate(&model, &empty, &config(SamplingConfig::greedy())).unwrap();
    assert!(seqs.is_empty());
}
