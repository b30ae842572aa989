//! Tests for the full MaMMUT model on the tiny preset.

use candle_core::{DType, Device, Tensor, D};
use mammut::model::config::Precision;
use mammut::model::mammut::CONTRASTIVE_ONLY_PARAMS;
use mammut::model::registry::tiny;
use mammut::{Mammut, MammutError, MammutInputs};

fn model() -> Mammut {
    Mammut::new(tiny(), &Device::Cpu).unwrap()
}

fn image(batch: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, 3, 32, 32), &Device::Cpu).unwrap()
}

fn text(batch: usize, len: usize) -> Tensor {
    let ids: Vec<u32> = (0..batch * len).map(|i| (i % 60) as u32 + 1).collect();
    Tensor::from_vec(ids, (batch, len), &Device::Cpu).unwrap()
}

fn row_norms(x: &Tensor) -> Vec<f32> {
    x.sqr().unwrap().sum(D::Minus1).unwrap().sqrt().unwrap().to_vec1().unwrap()
}

#[test]
fn test_encode_image_normalized() {
    let model = model();
    let features = model.encode_image(&image(2), true).unwrap();
    assert_eq!(features.dims(), &[2, 32]);
    for n in row_norms(&features) {
        assert!((n - 1.0).abs() < 1e-4, "norm {n}");
    }
}

#[test]
fn test_encode_image_with_tokens() {
    let model = model();
    let (latent, tokens) = model.encode_image_with_tokens(&image(2), false).unwrap();
    assert_eq!(latent.dims(), &[2, 32]);
    // 32x32 image, 8x8 patches, class token pooled away.
    assert_eq!(tokens.dims(), &[2, 16, 32]);
    assert_eq!(model.map_image_embs(&tokens).unwrap().dims(), &[2, 16, 32]);
}

#[test]
fn test_encode_text_normalized() {
    let model = model();
    let features = model.encode_text(&text(3, 6), None, true).unwrap();
    assert_eq!(features.dims(), &[3, 32]);
    for n in row_norms(&features) {
        assert!((n - 1.0).abs() < 1e-4, "norm {n}");
    }
}

#[test]
fn test_wrong_image_size_rejected() {
    let model = model();
    let bad = Tensor::zeros((1, 3, 48, 48), DType::F32, &Device::Cpu).unwrap();
    let err = model.encode_image(&bad, true).unwrap_err();
    assert!(matches!(err, MammutError::ShapeMismatch { .. }));
}

#[test]
fn test_text_longer_than_context_rejected() {
    let model = model();
    let err = model.text_logits(&text(1, 17), None).unwrap_err();
    assert!(matches!(err, MammutError::ShapeMismatch { .. }));
}

#[test]
fn test_forward_training_shapes() {
    let model = model();
    let (img, txt) = (image(2), text(2, 8));
    let out = model.forward(&MammutInputs::new(&img, &txt), true).unwrap();

    assert_eq!(out.image_features.unwrap().dims(), &[2, 32]);
    assert_eq!(out.text_features.unwrap().dims(), &[2, 32]);
    assert_eq!(out.logits.unwrap().dims(), &[2, 7, 64]);

    let labels = out.labels.unwrap();
    assert_eq!(labels.dims(), &[2, 7]);
    let expected = txt.narrow(1, 1, 7).unwrap();
    assert_eq!(labels.to_vec2::<u32>().unwrap(), expected.to_vec2::<u32>().unwrap());
}

#[test]
fn test_forward_eval_keeps_full_sequence() {
    let model = model();
    let (img, txt) = (image(1), text(1, 8));
    let out = model.forward(&MammutInputs::new(&img, &txt), false).unwrap();
    assert!(out.text_features.is_none());
    assert_eq!(out.logits.unwrap().dims(), &[1, 8, 64]);
    assert_eq!(out.labels.unwrap().dims(), &[1, 7]);
}

#[test]
fn test_forward_image_only() {
    let model = model();
    let img = image(1);
    let inputs = MammutInputs {
        image: Some(&img),
        ..Default::default()
    };
    let out = model.forward(&inputs, true).unwrap();
    assert!(out.image_features.is_some());
    assert!(out.logits.is_none());
    assert!(out.labels.is_none());
}

#[test]
fn test_forward_single_token_rejected() {
    let model = model();
    let (img, txt) = (image(1), text(1, 1));
    let err = model.forward(&MammutInputs::new(&img, &txt), true).unwrap_err();
    assert!(matches!(err, MammutError::InvalidInput(_)));
}

#[test]
fn test_logit_scale_is_exponentiated() {
    let model = model();
    let (img, txt) = (image(1), text(1, 4));
    let out = model.forward(&MammutInputs::new(&img, &txt), true).unwrap();
    assert!(out.logit_scale.dims().is_empty());
    let scale = out.logit_scale.to_scalar::<f32>().unwrap();
    assert!((scale - 1.0 / 0.07).abs() < 1e-3, "scale {scale}");
    assert!(out.logit_bias.is_none());
}

#[test]
fn test_nonscalar_logit_scale_and_bias() {
    let mut config = tiny();
    config.nonscalar_logit_scale = true;
    config.init_logit_bias = Some(-10.0);
    let model = Mammut::new(config, &Device::Cpu).unwrap();
    let (img, txt) = (image(1), text(1, 4));
    let out = model.forward(&MammutInputs::new(&img, &txt), true).unwrap();
    assert_eq!(out.logit_scale.dims(), &[1]);
    let bias = out.logit_bias.unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(bias, vec![-10.0]);
}

#[test]
fn test_disabling_contrastive_freezes_params() {
    let mut model = model();
    let all = model.trainable_vars().len();

    model.set_use_contrastive(false);
    assert!(!model.use_contrastive());
    for name in CONTRASTIVE_ONLY_PARAMS {
        assert!(model.is_frozen(name), "{name} should be frozen");
    }
    assert_eq!(model.trainable_vars().len(), all - CONTRASTIVE_ONLY_PARAMS.len());

    let (img, txt) = (image(1), text(1, 4));
    let out = model.forward(&MammutInputs::new(&img, &txt), true).unwrap();
    assert!(out.text_features.is_none());
    assert!(out.logits.is_some());

    model.set_use_contrastive(true);
    assert_eq!(model.trainable_vars().len(), all);
}

#[test]
fn test_set_requires_grad() {
    let mut model = model();
    model.set_requires_grad("map_viz2txt_kv", false).unwrap();
    assert!(model.is_frozen("map_viz2txt_kv"));
    model.set_requires_grad("map_viz2txt_kv", true).unwrap();
    assert!(!model.is_frozen("map_viz2txt_kv"));
    assert!(model.set_requires_grad("no.such.param", false).is_err());
}

#[test]
fn test_save_and_load_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.safetensors");

    let a = model();
    a.save_weights(&path).unwrap();
    let b = Mammut::from_checkpoint(tiny(), &path, &Device::Cpu).unwrap();

    let img = image(1);
    let fa = a.encode_image(&img, true).unwrap().to_vec2::<f32>().unwrap();
    let fb = b.encode_image(&img, true).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(fa, fb);
}

#[test]
fn test_grad_checkpointing_keeps_outputs() {
    let mut model = model();
    let img = image(1);
    let before = model.encode_image(&img, false).unwrap().to_vec2::<f32>().unwrap();
    model.set_grad_checkpointing(true);
    let after = model.encode_image(&img, false).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(before, after);
}

fn logits_f32(model: &Mammut, img: &Tensor, txt: &Tensor) -> Tensor {
    let out = model.forward(&MammutInputs::new(img, txt), false).unwrap();
    out.logits.unwrap().to_dtype(DType::F32).unwrap()
}

#[test]
fn test_half_precision_forward() {
    for precision in [Precision::F16, Precision::Bf16] {
        let mut config = tiny();
        config.precision = precision;
        let model = Mammut::new(config, &Device::Cpu).unwrap();
        let img = image(2).to_dtype(precision.dtype()).unwrap();
        let txt = text(2, 5);

        let out = model.forward(&MammutInputs::new(&img, &txt), true).unwrap();
        let logits = out.logits.unwrap();
        assert_eq!(logits.dtype(), precision.dtype());
        assert_eq!(logits.dims(), &[2, 4, 64]);
        let values = logits.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "{precision:?}");
        assert_eq!(out.text_features.unwrap().dims(), &[2, 32]);
    }
}

#[test]
fn test_quick_gelu_model_differs() {
    let gelu = model();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.safetensors");
    gelu.save_weights(&path).unwrap();

    let mut config = tiny();
    config.quick_gelu = true;
    let quick = Mammut::from_checkpoint(config, &path, &Device::Cpu).unwrap();

    let (img, txt) = (image(1), text(1, 6));
    let diff = (logits_f32(&gelu, &img, &txt) - logits_f32(&quick, &img, &txt))
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff > 0.0);
}
