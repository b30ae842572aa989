//! Tests for model configuration, presets and parameter accounting.

use std::io::Write;

use candle_core::Device;
use mammut::model::config::{MammutConfig, PoolType, Precision};
use mammut::model::registry::tiny;
use mammut::model::{create_model, get_model_config, list_models};
use mammut::weights::expected_tensors;
use mammut::{Mammut, MammutError};

#[test]
fn test_list_models_sorted() {
    let models = list_models();
    let mut sorted = models.clone();
    sorted.sort();
    assert_eq!(models, sorted);
    assert!(models.contains(&"mammut-tiny".to_string()));
    assert!(models.contains(&"mammut-vit-b-16".to_string()));
}

#[test]
fn test_unknown_model() {
    let err = get_model_config("mammut-vit-z-99").unwrap_err();
    assert!(matches!(err, MammutError::UnknownModel(_)));
}

#[test]
fn test_vit_b_16_preset() {
    let config = get_model_config("mammut-vit-b-16").unwrap();
    assert_eq!(config.embed_dim, 512);
    assert_eq!(config.vision_cfg.width, 768);
    assert_eq!(config.vision_cfg.heads(), 12);
    assert_eq!(config.vision_cfg.num_patches(), 196);
    assert_eq!(config.text_cfg.context_length, 77);
    assert_eq!(config.text_cfg.vocab_size, 49408);
    assert_eq!(config.text_cfg.cross_attn_layers(), 6);
}

#[test]
fn test_load_config_from_json() {
    let json = r#"{
        "embed_dim": 32,
        "vision_cfg": {"layers": 1, "width": 32, "head_width": 16, "patch_size": 8, "image_size": 16, "pool_type": "avg"},
        "text_cfg": {"context_length": 8, "vocab_size": 50, "width": 32, "heads": 4, "layers": 2},
        "precision": "bf16",
        "init_logit_bias": -10.0
    }"#;
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = get_model_config(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.vision_cfg.pool_type, PoolType::Avg);
    assert_eq!(config.vision_cfg.num_patches(), 4);
    assert_eq!(config.precision, Precision::Bf16);
    assert_eq!(config.init_logit_bias, Some(-10.0));
    assert!(config.text_cfg.does_full_decoding);
    assert!((config.init_logit_scale - (1.0f64 / 0.07).ln()).abs() < 1e-12);
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = tiny();
    config.vision_cfg.image_size = 30;
    assert!(matches!(config.validate(), Err(MammutError::Config(_))));

    let mut config = tiny();
    config.text_cfg.heads = 3;
    assert!(config.validate().is_err());

    let mut config = tiny();
    config.text_cfg.cross_attn_ratio = 1.5;
    assert!(config.validate().is_err());

    let mut config = tiny();
    config.embed_dim = 48;
    assert!(Mammut::new(config, &Device::Cpu).is_err());
}

fn variants() -> Vec<MammutConfig> {
    let base = tiny();
    let mut with_ls = base.clone();
    with_ls.vision_cfg.ls_init_value = Some(0.1);
    with_ls.text_cfg.ls_init_value = Some(0.1);

    let mut with_bias = base.clone();
    with_bias.init_logit_bias = Some(-10.0);
    with_bias.nonscalar_logit_scale = true;

    let mut avg_no_mlp = base.clone();
    avg_no_mlp.vision_cfg.pool_type = PoolType::Avg;
    avg_no_mlp.text_cfg.has_mlp = false;
    avg_no_mlp.text_cfg.does_full_decoding = false;
    avg_no_mlp.text_cfg.cross_attn_ratio = 1.0;

    vec![base, with_ls, with_bias, avg_no_mlp]
}

#[test]
fn test_estimated_params_match_built_model() {
    for config in variants() {
        let model = Mammut::new(config.clone(), &Device::Cpu).unwrap();
        assert_eq!(model.num_params(), config.estimated_params(), "{config:?}");
        assert_eq!(model.num_params_with_prefix("visual"), config.vision_params());
        assert_eq!(model.num_params_with_prefix("text"), config.text_params());
    }
}

#[test]
fn test_expected_tensors_match_built_model() {
    for config in variants() {
        let model = Mammut::new(config.clone(), &Device::Cpu).unwrap();
        let built: Vec<(String, Vec<usize>)> = model
            .named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.dims().to_vec()))
            .collect();
        let expected: Vec<(String, Vec<usize>)> = expected_tensors(&config).into_iter().collect();
        assert_eq!(built, expected);
    }
}

#[test]
fn test_create_model_by_name() {
    let model = create_model("mammut-tiny", &Device::Cpu).unwrap();
    assert_eq!(model.config, tiny());
    assert!(model.use_contrastive());
}

#[test]
fn test_version_is_package_version() {
    assert_eq!(mammut::VERSION, env!("CARGO_PKG_VERSION"));
    assert!(mammut::VERSION.split('.').count() >= 3);
}
