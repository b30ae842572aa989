//! Named model presets.
//!
//! Presets follow the usual ViT sizes for the image tower paired with a
//! decoder as wide as the shared embedding space. Any name ending in
//! `.json` is read as a config file instead.

use std::path::Path;

use candle_core::Device;

use crate::error::{MammutError, Result};
use crate::model::config::{MammutConfig, MultimodalConfig, VisionConfig};
use crate::model::mammut::Mammut;

const PRESETS: [&str; 4] = ["mammut-tiny", "mammut-vit-b-16", "mammut-vit-b-32", "mammut-vit-l-14"];

/// Names of all built-in presets, sorted.
pub fn list_models() -> Vec<String> {
    PRESETS.iter().map(|s| s.to_string()).collect()
}

/// Configuration for a preset name or a `.json` config path.
pub fn get_model_config(name: &str) -> Result<MammutConfig> {
    if name.ends_with(".json") {
        return load_config(Path::new(name));
    }
    let config = match name.to_ascii_lowercase().as_str() {
        "mammut-tiny" => tiny(),
        "mammut-vit-b-16" => vit_base(16),
        "mammut-vit-b-32" => vit_base(32),
        "mammut-vit-l-14" => vit_large_14(),
        _ => return Err(MammutError::UnknownModel(name.to_string())),
    };
    Ok(config)
}

/// Load and validate a model configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<MammutConfig> {
    let data = std::fs::read_to_string(path)?;
    let config: MammutConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

/// Build a freshly initialised model by name.
pub fn create_model(name: &str, device: &Device) -> Result<Mammut> {
    let config = get_model_config(name)?;
    Mammut::new(config, device)
}

/// A few-thousand-parameter model for tests and smoke runs.
pub fn tiny() -> MammutConfig {
    MammutConfig {
        embed_dim: 32,
        vision_cfg: VisionConfig {
            layers: 2,
            width: 32,
            head_width: 16,
            patch_size: 8,
            image_size: 32,
            ..VisionConfig::default()
        },
        text_cfg: MultimodalConfig {
            context_length: 16,
            vocab_size: 64,
            width: 32,
            heads: 2,
            layers: 2,
            ..MultimodalConfig::default()
        },
        quick_gelu: false,
        precision: Default::default(),
        pad_id: 0,
        init_logit_scale: (1.0f64 / 0.07).ln(),
        init_logit_bias: None,
        nonscalar_logit_scale: false,
    }
}

fn vit_base(patch_size: usize) -> MammutConfig {
    MammutConfig {
        embed_dim: 512,
        vision_cfg: VisionConfig {
            layers: 12,
            width: 768,
            patch_size,
            image_size: 224,
            ..VisionConfig::default()
        },
        text_cfg: MultimodalConfig {
            width: 512,
            heads: 8,
            layers: 12,
            ..MultimodalConfig::default()
        },
        ..tiny()
    }
}

fn vit_large_14() -> MammutConfig {
    MammutConfig {
        embed_dim: 768,
        vision_cfg: VisionConfig {
            layers: 24,
            width: 1024,
            patch_size: 14,
            image_size: 224,
            ..VisionConfig::default()
        },
        text_cfg: MultimodalConfig {
            width: 768,
            heads: 12,
            layers: 12,
            ..MultimodalConfig::default()
        },
        ..tiny()
    }
}
