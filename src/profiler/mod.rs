//! Compute and parameter profiling of model presets.
//!
//! Each model is built, fed an all-ones image and all-ones token batch, and
//! run once with an [`OpCounter`] installed. Two summaries are available:
//!
//! - [`ProfilerKind::Flops`]: total FLOPs (two per multiply-accumulate);
//! - [`ProfilerKind::Macs`]: multiply-accumulates plus output activations.
//!
//! Failures are per model: [`run`] logs them and carries on.

pub mod report;

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};

use crate::error::{MammutError, Result};
use crate::flops::OpCounter;
use crate::model::config::MammutConfig;
use crate::model::{get_model_config, list_models, Mammut, MammutInputs};

pub use report::{ProfileReport, ProfileRow};

/// Which compute summary to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfilerKind {
    /// `gflops` column.
    #[default]
    Flops,
    /// `gmacs` and `macts` columns.
    Macs,
}

impl FromStr for ProfilerKind {
    type Err = MammutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flops" => Ok(ProfilerKind::Flops),
            "macs" => Ok(ProfilerKind::Macs),
            other => Err(MammutError::InvalidInput(format!(
                "unknown profiler '{other}', expected 'flops' or 'macs'"
            ))),
        }
    }
}

impl fmt::Display for ProfilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfilerKind::Flops => f.write_str("flops"),
            ProfilerKind::Macs => f.write_str("macs"),
        }
    }
}

/// Settings shared by every profiled model.
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    pub batch_size: usize,
    /// Input image side; `None` uses the model's configured size.
    pub image_size: Option<usize>,
    /// Input token count; `None` uses the model's context length.
    pub text_size: Option<usize>,
    pub profiler: ProfilerKind,
    /// Profile with the contrastive objective disabled.
    pub no_contrastive: bool,
    pub device: Device,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        ProfileOptions {
            batch_size: 1,
            image_size: None,
            text_size: None,
            profiler: ProfilerKind::Flops,
            no_contrastive: false,
            device: Device::Cpu,
        }
    }
}

/// Expand a `--model` argument: `all` or a comma-separated list.
pub fn parse_model_list(arg: &str) -> Vec<String> {
    if arg.trim() == "all" {
        return list_models();
    }
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Total parameter count of a model.
pub fn count_params(model: &Mammut) -> usize {
    model.num_params()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Profile one model by name.
///
/// A failure on an accelerator is retried once on the CPU.
pub fn profile_model(name: &str, options: &ProfileOptions) -> Result<ProfileRow> {
    let config = get_model_config(name)?;
    match profile_on(name, &config, options, &options.device) {
        Err(e) if !options.device.is_cpu() => {
            tracing::warn!(model = name, error = %e, "profiling failed on accelerator, retrying on CPU");
            profile_on(name, &config, options, &Device::Cpu)
        }
        result => result,
    }
}

fn profile_on(
    name: &str,
    config: &MammutConfig,
    options: &ProfileOptions,
    device: &Device,
) -> Result<ProfileRow> {
    if options.batch_size == 0 {
        return Err(MammutError::InvalidInput("batch size must be positive".into()));
    }
    let image_size = options.image_size.unwrap_or(config.vision_cfg.image_size);
    let text_size = options.text_size.unwrap_or(config.text_cfg.context_length);

    let mut model = Mammut::new(config.clone(), device)?;
    if options.no_contrastive {
        model.set_use_contrastive(false);
    }

    let mut row = ProfileRow {
        model: name.to_string(),
        image_size,
        mparams: round2(count_params(&model) as f64 / 1e6),
        image_mparams: round2(model.num_params_with_prefix("visual") as f64 / 1e6),
        text_mparams: round2(model.num_params_with_prefix("text") as f64 / 1e6),
        gflops: None,
        gmacs: None,
        macts: None,
    };

    let b = options.batch_size;
    let image = Tensor::ones((b, 3, image_size, image_size), config.dtype(), device)?;
    let text = Tensor::ones((b, text_size), DType::U32, device)?;

    let counter = OpCounter::new();
    {
        let _guard = counter.install();
        model.forward(&MammutInputs::new(&image, &text), true)?;
    }

    let per_sample = |total: u64| total as f64 / b as f64;
    match options.profiler {
        ProfilerKind::Flops => {
            row.gflops = Some(round2(per_sample(counter.total_flops()) / 1e9));
        }
        ProfilerKind::Macs => {
            row.gmacs = Some(round2(per_sample(counter.total_macs()) / 1e9));
            row.macts = Some(round2(per_sample(counter.total_activations()) / 1e6));
        }
    }
    for (kind, macs) in counter.macs_by_kind() {
        tracing::debug!(model = name, op = %kind, macs, "op breakdown");
    }
    Ok(row)
}

/// Profile every model, collecting failures instead of stopping.
pub fn run(models: &[String], options: &ProfileOptions) -> ProfileReport {
    let mut report = ProfileReport::new(options.profiler);
    for name in models {
        tracing::info!(model = %name, profiler = %options.profiler, "profiling");
        match profile_model(name, options) {
            Ok(row) => report.rows.push(row),
            Err(e) => {
                let chain = error_chain(&e);
                tracing::error!(model = %name, error = %chain, "error profiling model");
                report.models_with_errors.push(name.clone());
            }
        }
    }
    report.sort();
    report
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}
