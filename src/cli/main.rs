//! Batch relighting CLI
//!
//! Resolves (and if needed downloads) the model weights, loads the backends
//! once and relights every portrait of an input directory.

use super::config::CliConfigBuilder;
use super::progress::IndicatifProgressReporter;
use crate::{
    batch::BatchDriver,
    cache::ModelCache,
    config::{BackendType, DEFAULT_ADDED_PROMPT, DEFAULT_NEGATIVE_PROMPT, NORMAL_MODE_BRIGHTNESS_BIAS, NORMAL_SHARPNESS},
    download::ModelDownloader,
    inference::{DiffusionBackend, InferenceBackend},
    models::{ModelManager, ModelPaths},
    processor::RelightProcessor,
    tracing_config::{init_cli_tracing, spans, TracingFormat},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;

const MAINTENANCE_FLAGS: [&str; 3] = ["list_models", "clear_cache", "only_download"];

/// Batch portrait relighting with IC-Light
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "iclight-relight")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Directory of input PNG portraits
    #[arg(long = "input_dir", required_unless_present_any = MAINTENANCE_FLAGS)]
    pub input_dir: Option<PathBuf>,

    /// Directory receiving the relit images
    #[arg(long = "output_dir", required_unless_present_any = MAINTENANCE_FLAGS)]
    pub output_dir: Option<PathBuf>,

    /// Prompt shared by every image
    #[arg(long, required_unless_present_any = MAINTENANCE_FLAGS)]
    pub prompt: Option<String>,

    /// Lighting preset for every image (e.g. "Left Light", CUSTOM_GRAY)
    #[arg(long = "bg_source")]
    pub bg_source: Option<String>,

    /// Derive the preset of each image from its light-direction label
    #[arg(long = "use_light_labels", conflicts_with = "bg_source")]
    pub use_light_labels: bool,

    /// Background image for the upload presets
    #[arg(long = "bg_image", value_name = "PATH")]
    pub bg_image: Option<PathBuf>,

    /// Samples per image
    #[arg(long = "num_samples", default_value_t = 1)]
    pub num_samples: usize,

    #[arg(long, default_value_t = 12345)]
    pub seed: u64,

    #[arg(long = "image_width", default_value_t = 512)]
    pub image_width: u32,

    #[arg(long = "image_height", default_value_t = 640)]
    pub image_height: u32,

    /// Denoising steps of the base pass
    #[arg(long, default_value_t = 25)]
    pub steps: usize,

    /// Classifier-free guidance scale
    #[arg(long, default_value_t = 2.0)]
    pub cfg: f64,

    #[arg(long = "highres_scale", default_value_t = 1.5)]
    pub highres_scale: f64,

    #[arg(long = "highres_denoise", default_value_t = 0.5)]
    pub highres_denoise: f64,

    /// Suffix appended to the prompt
    #[arg(long = "a_prompt", default_value = DEFAULT_ADDED_PROMPT)]
    pub a_prompt: String,

    /// Negative prompt
    #[arg(long = "n_prompt", default_value = DEFAULT_NEGATIVE_PROMPT)]
    pub n_prompt: String,

    /// Light-direction labels, one line per image
    #[arg(long = "source_info_file", required_unless_present_any = MAINTENANCE_FLAGS)]
    pub source_info_file: Option<PathBuf>,

    /// Hair-color labels, one line per image
    #[arg(long = "color_info_file", required_unless_present_any = MAINTENANCE_FLAGS)]
    pub color_info_file: Option<PathBuf>,

    /// Relight images or estimate normal maps
    #[arg(long, value_enum, default_value_t = CliMode::Relight)]
    pub mode: CliMode,

    /// Write every output of an image as <stem>_<i>.png
    #[arg(long = "save_all")]
    pub save_all: bool,

    /// Normal estimation sharpness
    #[arg(long = "normal_sharpness", default_value_t = NORMAL_SHARPNESS)]
    pub normal_sharpness: f32,

    /// Foreground brightness bias of the normal passes
    #[arg(long = "normal_bias", default_value_t = NORMAL_MODE_BRIGHTNESS_BIAS)]
    pub normal_bias: f32,

    /// Directory holding local weight files (checked before the cache)
    #[arg(long = "models_dir", value_name = "PATH")]
    pub models_dir: Option<PathBuf>,

    /// Use a custom cache directory
    #[arg(long = "cache_dir", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Execution provider: auto, cpu or cuda
    #[arg(long = "execution_provider", default_value = "auto")]
    pub execution_provider: String,

    /// Inference engine of the matting model
    #[arg(long = "matting_backend", value_enum, default_value_t = CliMattingBackend::Onnx)]
    pub matting_backend: CliMattingBackend,

    /// List cached weight files and exit
    #[arg(long = "list_models")]
    pub list_models: bool,

    /// Remove every cached weight file and exit
    #[arg(long = "clear_cache")]
    pub clear_cache: bool,

    /// Download missing weight files and exit
    #[arg(long = "only_download")]
    pub only_download: bool,

    /// Log output format
    #[arg(long = "log_format", value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliMode {
    Relight,
    Normal,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliMattingBackend {
    Onnx,
    Tract,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session_id =
        init_cli_tracing(cli.verbose, cli.log_format.into()).context("Failed to initialize tracing")?;

    let cache = match &cli.cache_dir {
        Some(dir) => ModelCache::with_custom_cache_dir(dir).context("Failed to create cache with custom directory")?,
        None => ModelCache::new().context("Failed to initialize model cache")?,
    };

    if cli.list_models {
        return list_cached_models(&cache);
    }

    if cli.clear_cache {
        return clear_cache_models(&cache);
    }

    let manager = ModelManager::new(cache.clone(), cli.models_dir.clone());
    let downloader = ModelDownloader::new(cache).context("Failed to create model downloader")?;

    if cli.only_download {
        let paths = manager
            .resolve(&downloader, true)
            .await
            .context("Failed to download model weights")?;
        println!("All model weights available:");
        print_model_paths(&paths);
        return Ok(());
    }

    let config = CliConfigBuilder::from_cli(&cli).context("Invalid CLI arguments")?;
    let batch = CliConfigBuilder::batch_config(&cli).context("Invalid CLI arguments")?;

    let paths = manager
        .resolve(&downloader, true)
        .await
        .context("Failed to resolve model weights")?;

    let session = spans::session(
        &session_id,
        &format!("{:?}", config.mode).to_lowercase(),
        &config.execution_provider.to_string(),
    );
    let _session = session.enter();

    info!("Loading relighting model");
    let diffusion = create_diffusion_backend(&paths, &config).context("Failed to load relighting model")?;
    let matting = create_matting_backend(&paths, config.matting_backend)?;

    let mut processor = RelightProcessor::new(config, diffusion, matting).context("Failed to create processor")?;
    processor.initialize().context("Failed to load matting model")?;

    let reporter = IndicatifProgressReporter::new(cli.verbose == 0);
    let summary = BatchDriver::new(&mut processor)
        .with_reporter(&reporter)
        .run(&batch)
        .context("Batch relighting failed")?;

    if summary.processed == 0 {
        warn!("No images were processed");
    }
    println!(
        "Processed {} image(s), wrote {} file(s) to {} in {:.1}s",
        summary.processed,
        summary.written.len(),
        batch.output_dir.display(),
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(feature = "candle")]
fn create_diffusion_backend(
    paths: &ModelPaths,
    config: &crate::config::RelightConfig,
) -> Result<Box<dyn DiffusionBackend>> {
    let backend = crate::backends::CandleDiffusionBackend::load(paths, config.execution_provider)?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "candle"))]
fn create_diffusion_backend(
    _paths: &ModelPaths,
    _config: &crate::config::RelightConfig,
) -> Result<Box<dyn DiffusionBackend>> {
    anyhow::bail!("No diffusion backend compiled in. Rebuild with --features candle")
}

fn create_matting_backend(paths: &ModelPaths, backend: BackendType) -> Result<Box<dyn InferenceBackend>> {
    match backend {
        #[cfg(feature = "onnx")]
        BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::new(&paths.rmbg))),
        #[cfg(feature = "tract")]
        BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::new(&paths.rmbg))),
        #[allow(unreachable_patterns)]
        other => anyhow::bail!(
            "Matting backend {:?} is not compiled in. Rebuild with --features {:?}",
            other,
            other
        ),
    }
}

fn print_model_paths(paths: &ModelPaths) {
    println!("  tokenizer:       {}", paths.tokenizer.display());
    println!("  text encoder:    {}", paths.text_encoder.display());
    println!("  vae:             {}", paths.vae.display());
    println!("  unet:            {}", paths.unet.display());
    println!("  ic-light offset: {}", paths.iclight_offset.display());
    println!("  rmbg matting:    {}", paths.rmbg.display());
}

/// List cached weight files
fn list_cached_models(cache: &ModelCache) -> Result<()> {
    let files = cache
        .scan_cached_files()
        .context("Failed to list cached models")?;

    println!("Cached model files ({})", cache.cache_dir().display());

    if files.is_empty() {
        println!("No cached model files found.");
        println!("Run with --only_download to fetch the weights.");
        return Ok(());
    }

    for file in files {
        println!("{}", file.file_id);
        println!("  size: {}", ModelCache::format_size(file.size_bytes));
        match file.manifest {
            Some(manifest) => {
                println!("  source: {}", manifest.url);
                println!("  sha256: {}", manifest.sha256);
                println!("  downloaded: {}", manifest.downloaded_at.to_rfc3339());
            },
            None => println!("  (no download manifest)"),
        }
    }

    Ok(())
}

/// Clear cached weight files
fn clear_cache_models(cache: &ModelCache) -> Result<()> {
    let removed = cache.clear_all_models().context("Failed to clear cache")?;
    if removed.is_empty() {
        println!("Cache was already empty");
    } else {
        println!("Removed {} cached repository(ies):", removed.len());
        for model_id in &removed {
            println!("  {}", model_id);
        }
    }
    println!("Cache location: {}", cache.cache_dir().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 11] = [
        "iclight-relight",
        "--input_dir",
        "in",
        "--output_dir",
        "out",
        "--prompt",
        "a portrait",
        "--source_info_file",
        "light.txt",
        "--color_info_file",
        "hair.txt",
    ];

    #[test]
    fn test_defaults_match_generation_defaults() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cli.num_samples, 1);
        assert_eq!(cli.seed, 12345);
        assert_eq!((cli.image_width, cli.image_height), (512, 640));
        assert_eq!(cli.steps, 25);
        assert!((cli.cfg - 2.0).abs() < f64::EPSILON);
        assert!((cli.highres_scale - 1.5).abs() < f64::EPSILON);
        assert!((cli.highres_denoise - 0.5).abs() < f64::EPSILON);
        assert_eq!(cli.a_prompt, DEFAULT_ADDED_PROMPT);
        assert_eq!(cli.n_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(cli.bg_source, None);
        assert_eq!(cli.mode, CliMode::Relight);
        assert_eq!(cli.matting_backend, CliMattingBackend::Onnx);
    }

    #[test]
    fn test_underscore_flags_parse() {
        let mut args: Vec<&str> = REQUIRED.to_vec();
        args.extend([
            "--bg_source",
            "Left Light",
            "--num_samples",
            "2",
            "--image_width",
            "768",
            "--highres_denoise",
            "0.3",
            "--mode",
            "normal",
            "--save_all",
            "-vv",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.bg_source.as_deref(), Some("Left Light"));
        assert_eq!(cli.num_samples, 2);
        assert_eq!(cli.image_width, 768);
        assert_eq!(cli.mode, CliMode::Normal);
        assert!(cli.save_all);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_required_arguments() {
        assert!(Cli::try_parse_from(["iclight-relight", "--input_dir", "in"]).is_err());
        assert!(Cli::try_parse_from(["iclight-relight", "--list_models"]).is_ok());
        assert!(Cli::try_parse_from(["iclight-relight", "--only_download"]).is_ok());
    }

    #[test]
    fn test_light_labels_conflict_with_fixed_preset() {
        let mut args: Vec<&str> = REQUIRED.to_vec();
        args.extend(["--bg_source", "Left Light", "--use_light_labels"]);
        assert!(Cli::try_parse_from(args).is_err());
    }
}
