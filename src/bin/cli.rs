//! Command-line interface for mammut.
//!
//! Profiles model presets, prints preset configurations and inspects
//! safetensors checkpoints.

use std::path::PathBuf;
use std::process::ExitCode;

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mammut::model::{get_model_config, list_models};
use mammut::profiler::{self, ProfileOptions, ProfilerKind};
use mammut::weights::{validate_checkpoint, SafetensorsFile};

/// mammut: MaMMUT model presets, profiling and checkpoint tools
#[derive(Parser)]
#[command(name = "mammut", version = mammut::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count parameters and compute cost of one or more models.
    Profile {
        /// Comma-separated preset names or config files, or `all`.
        #[arg(long, default_value = "all")]
        model: String,

        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// Input image side. Defaults to each model's configured size.
        #[arg(long)]
        image_size: Option<usize>,

        /// Input token count. Defaults to each model's context length.
        #[arg(long)]
        text_size: Option<usize>,

        /// `flops` or `macs`.
        #[arg(long, default_value = "flops")]
        profiler: ProfilerKind,

        /// Write results to this CSV file.
        #[arg(long)]
        results_file: Option<PathBuf>,

        /// Disable the contrastive objective before profiling.
        #[arg(long)]
        no_contrastive: bool,

        /// Profile on the CPU even if an accelerator is available.
        #[arg(long)]
        cpu: bool,
    },

    /// Show a preset's configuration and parameter estimate.
    Info {
        /// Preset name or config file. Lists presets when omitted.
        preset: Option<String>,
    },

    /// List the tensors of a safetensors checkpoint.
    Inspect {
        checkpoint: PathBuf,

        /// Check the checkpoint against this preset.
        #[arg(long)]
        model: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Profile {
            model,
            batch_size,
            image_size,
            text_size,
            profiler,
            results_file,
            no_contrastive,
            cpu,
        } => {
            let device = if cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available(0).unwrap_or(Device::Cpu)
            };
            let options = ProfileOptions {
                batch_size,
                image_size,
                text_size,
                profiler,
                no_contrastive,
                device,
            };
            cmd_profile(&model, &options, results_file)
        }
        Command::Info { preset } => cmd_info(preset.as_deref()),
        Command::Inspect { checkpoint, model } => cmd_inspect(&checkpoint, model.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_profile(
    model: &str,
    options: &ProfileOptions,
    results_file: Option<PathBuf>,
) -> mammut::Result<ExitCode> {
    let models = profiler::parse_model_list(model);
    if models.is_empty() {
        eprintln!("error: no models given");
        return Ok(ExitCode::FAILURE);
    }

    let report = profiler::run(&models, options);
    print!("{report}");
    if !report.models_with_errors.is_empty() {
        println!();
        println!("Models with errors: {}", report.models_with_errors.join(", "));
    }
    if report.is_empty() {
        return Ok(ExitCode::FAILURE);
    }
    if let Some(path) = results_file {
        report.write_csv(&path)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_info(preset: Option<&str>) -> mammut::Result<ExitCode> {
    let Some(name) = preset else {
        println!("mammut v{}", mammut::VERSION);
        println!();
        println!("Available presets:");
        for name in list_models() {
            println!("  {name}");
        }
        return Ok(ExitCode::SUCCESS);
    };

    let config = get_model_config(name)?;
    let v = &config.vision_cfg;
    let t = &config.text_cfg;

    println!("{name}");
    println!("{}", "=".repeat(50));
    println!("Embed dim:           {}", config.embed_dim);
    println!("Precision:           {:?}", config.precision);
    println!("Vision layers:       {}", v.layers);
    println!("Vision width:        {} ({} heads)", v.width, v.heads());
    println!("Patch / image size:  {} / {}", v.patch_size, v.image_size);
    println!("Pooling:             {:?}", v.pool_type);
    println!("Text layers:         {}", t.layers);
    println!("Text width:          {} ({} heads)", t.width, t.heads);
    println!("Context length:      {}", t.context_length);
    println!("Vocabulary size:     {}", t.vocab_size);
    println!("Cross-attn after:    {:?}", t.cross_attn_positions());
    println!();

    let params = config.estimated_params();
    println!("Estimated parameters:  {:.2}M", params as f64 / 1e6);
    println!("  vision:              {:.2}M", config.vision_params() as f64 / 1e6);
    println!("  text:                {:.2}M", config.text_params() as f64 / 1e6);
    println!(
        "Memory ({:?}):         {:.1} MB",
        config.precision,
        config.estimated_memory_bytes() as f64 / 1e6
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_inspect(path: &std::path::Path, model: Option<&str>) -> mammut::Result<ExitCode> {
    let file = SafetensorsFile::open(path)?;
    let names = file.tensor_names();

    println!(
        "{} ({:.1} MB, {} tensors, {:.2}M params)",
        path.display(),
        file.file_size() as f64 / 1e6,
        names.len(),
        file.num_params() as f64 / 1e6
    );
    for name in names.iter().take(20) {
        if let Some(info) = file.header.tensors.get(*name) {
            println!("  {name}: {} {:?}", info.dtype, info.shape);
        }
    }
    if names.len() > 20 {
        println!("  ... and {} more", names.len() - 20);
    }
    if !file.header.metadata.is_empty() {
        println!();
        println!("Metadata:");
        for (k, v) in &file.header.metadata {
            println!("  {k}: {v}");
        }
    }

    let Some(model) = model else {
        return Ok(ExitCode::SUCCESS);
    };
    let config = get_model_config(model)?;
    let report = validate_checkpoint(&file, &config);
    println!();
    for name in &report.missing {
        println!("missing:    {name}");
    }
    for name in &report.unexpected {
        println!("unexpected: {name}");
    }
    for (name, expected, found) in &report.mismatched {
        println!("mismatched: {name} expected {expected:?}, found {found:?}");
    }
    if report.is_compatible() {
        println!("Checkpoint is compatible with {model}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Checkpoint is NOT compatible with {model}");
        Ok(ExitCode::FAILURE)
    }
}
