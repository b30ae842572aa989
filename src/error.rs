//! Error types for the mammut crate.

use thiserror::Error;

/// Top-level error type for model construction, inference and profiling.
#[derive(Error, Debug)]
pub enum MammutError {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("weight loading error: {0}")]
    WeightLoad(String),

    #[error("sampling error: {0}")]
    Sampling(#[from] crate::sampling::SamplingError),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),
}

pub type Result<T> = std::result::Result<T, MammutError>;
