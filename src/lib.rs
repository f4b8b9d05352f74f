#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # iclight-relight
//!
//! Batch portrait relighting with IC-Light (foreground/background
//! conditioned Stable Diffusion 1.5) and RMBG-1.4 foreground extraction.
//!
//! For every PNG portrait of an input directory the pipeline:
//!
//! 1. strips the background with the matting network and composites the
//!    subject on gray,
//! 2. synthesizes a lighting background from a preset (gradients, flat
//!    colors or an uploaded image),
//! 3. runs a base denoising pass conditioned on both latents, then an
//!    image-to-image highres pass,
//! 4. writes the first sample under the input file name.
//!
//! A normal-map mode runs four directional passes and merges them into a
//! surface normal estimate.
//!
//! ## Feature Flags
//!
//! - `onnx` (default): ONNX Runtime matting backend
//! - `tract` (default): pure Rust matting backend
//! - `candle` (default): diffusion backend on candle
//! - `cuda`: CUDA support for the candle backend
//! - `cli` (default): command-line interface and progress bars
//! - `tracing-json`: JSON log output for the CLI
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use iclight_relight::{
//!     backends::{CandleDiffusionBackend, OnnxBackend},
//!     BatchConfig, BatchDriver, ModelCache, ModelDownloader, ModelManager, RelightConfig,
//!     RelightProcessor,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = ModelCache::new()?;
//! let manager = ModelManager::new(cache.clone(), None);
//! let paths = manager.resolve(&ModelDownloader::new(cache)?, true).await?;
//!
//! let config = RelightConfig::builder().seed(42).build()?;
//! let diffusion = CandleDiffusionBackend::load(&paths, config.execution_provider)?;
//! let matting = OnnxBackend::new(&paths.rmbg);
//! let mut processor = RelightProcessor::new(config, Box::new(diffusion), Box::new(matting))?;
//!
//! let batch = BatchConfig::new("portraits", "relit", "a portrait", "light.txt", "hair.txt");
//! let summary = BatchDriver::new(&mut processor).run(&batch)?;
//! println!("relit {} images", summary.processed);
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod backends;
pub mod batch;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod matting;
pub mod models;
pub mod normal;
pub mod processor;
pub mod services;
pub mod text;
pub mod tracing_config;
pub mod types;
pub mod utils;

pub use background::BackgroundSynthesizer;
pub use batch::{BatchConfig, BatchDriver, BatchSummary, PresetPolicy};
pub use cache::{DownloadManifest, ModelCache};
pub use config::{
    BackendType, ExecutionProvider, GenerationParams, LightingPreset, RelightConfig,
    RelightConfigBuilder, RelightMode,
};
pub use download::{validate_model_url, ModelDownloader};
pub use error::{RelightError, Result};
pub use inference::{DiffusionBackend, InferenceBackend, SamplingRequest};
pub use matting::ForegroundExtractor;
pub use models::{ModelComponent, ModelManager, ModelPaths};
pub use normal::NormalMapEstimator;
pub use processor::RelightProcessor;
pub use services::{ImageIOService, NoOpProgressReporter, ProgressReporter};
pub use types::{AlphaMatte, GenerationRequest, GenerationResult};
pub use utils::ImagePreprocessor;

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat};
