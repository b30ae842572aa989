//! MaMMUT model architecture.
//!
//! This module implements the MaMMUT vision-language model on candle:
//!
//! - [`config`]: Model hyperparameters.
//! - [`registry`]: Named presets and config files.
//! - [`norm`]: LayerNorm with f32 upcast for half precision.
//! - [`linear`]: Linear projections reporting to the op counter.
//! - [`embedding`]: Token and positional embeddings.
//! - [`attention`]: Multi-head self- and cross-attention.
//! - [`transformer`]: Residual blocks and plain transformer stacks.
//! - [`vision`]: Vision transformer tower.
//! - [`decoder`]: Multimodal text decoder.
//! - [`mammut`]: Full model composition.

pub mod attention;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod linear;
pub mod mammut;
pub mod norm;
pub mod registry;
pub mod transformer;
pub mod vision;

pub use config::{MammutConfig, MultimodalConfig, PoolType, Precision, VisionConfig};
pub use mammut::{Mammut, MammutInputs, MammutOutput};
pub use registry::{create_model, get_model_config, list_models};
