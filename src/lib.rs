//! MaMMUT vision-language model and compute profiler.
//!
//! This crate implements MaMMUT on candle: a vision transformer and a single
//! multimodal text decoder that is used both as the contrastive text encoder
//! and as a captioning decoder cross-attending to image tokens. A profiler
//! reports parameter counts and FLOP or MAC estimates for named presets.

pub mod error;
pub mod flops;
pub mod generation;
pub mod model;
pub mod profiler;
pub mod sampling;
pub mod weights;

pub use error::{MammutError, Result};
pub use model::{Mammut, MammutConfig, MammutInputs, MammutOutput};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
