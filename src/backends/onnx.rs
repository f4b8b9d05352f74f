//! ONNX Runtime backend for the RMBG matting network
//!
//! Loads the matting model from disk and runs it with the configured
//! execution provider (CUDA when available, CPU otherwise).

use crate::config::{ExecutionProvider, RelightConfig};
use crate::error::{RelightError, Result};
use crate::inference::InferenceBackend;
use ndarray::Array4;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider as OrtExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::{self, value::Value};
use std::path::{Path, PathBuf};

use instant::{Duration, Instant};

/// ONNX Runtime backend for running the matting model
#[derive(Debug)]
pub struct OnnxBackend {
    model_path: PathBuf,
    session: Option<Session>,
    initialized: bool,
}

impl OnnxBackend {
    /// List ONNX Runtime execution providers with availability status
    pub fn list_providers() -> Vec<(String, bool, String)> {
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available,
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
        ]
    }

    /// Create a backend for the model at `model_path`
    #[must_use]
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            session: None,
            initialized: false,
        }
    }

    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn load_model(&mut self, config: &RelightConfig) -> Result<Duration> {
        let model_load_start = Instant::now();

        let mut session_builder = Session::builder()
            .map_err(|e| RelightError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RelightError::inference(format!("Failed to set optimization level: {e}")))?;

        session_builder = match config.execution_provider {
            ExecutionProvider::Auto | ExecutionProvider::Cuda => {
                let cuda_provider = CUDAExecutionProvider::default();
                if OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
                    log::info!("Using CUDA execution provider for matting");
                    session_builder
                        .with_execution_providers([cuda_provider.build()])
                        .map_err(|e| {
                            RelightError::inference(format!("Failed to set CUDA execution provider: {e}"))
                        })?
                } else {
                    if config.execution_provider == ExecutionProvider::Cuda {
                        log::warn!("CUDA execution provider requested but not available, falling back to CPU");
                    }
                    session_builder
                }
            },
            ExecutionProvider::Cpu => {
                log::info!("Using CPU execution provider for matting");
                session_builder
            },
        };

        let intra_threads = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(8);

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| RelightError::inference(format!("Failed to set intra threads: {e}")))?
            .commit_from_file(&self.model_path)
            .map_err(|e| {
                RelightError::model_error_with_context(
                    "load",
                    &self.model_path,
                    &e.to_string(),
                    &["check that the file is the RMBG-1.4 ONNX export", "clear the cache and download again"],
                )
            })?;

        self.session = Some(session);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Matting model loaded in {:.0}ms ({})",
            model_load_time.as_secs_f64() * 1000.0,
            self.model_path.display()
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &RelightConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(RelightError::internal("Backend not initialized"));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| RelightError::internal("ONNX session not initialized"))?;

        let inference_start = Instant::now();
        log::debug!("Running ONNX matting inference on {:?}", input.dim());

        let input_value = Value::from_array(input.clone())
            .map_err(|e| RelightError::processing(format!("Failed to convert input tensor: {e}")))?;

        // RMBG exposes several side outputs; the first one is the finest matte
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| RelightError::inference(format!("ONNX inference failed: {e}")))?;

        let output_tensor = {
            let keys: Vec<_> = outputs.keys().collect();
            let first_key = keys
                .first()
                .ok_or_else(|| RelightError::processing("No output tensors found"))?;
            outputs
                .get(first_key)
                .ok_or_else(|| RelightError::processing("First output tensor not found"))?
                .try_extract_array::<f32>()
                .map_err(|e| RelightError::processing(format!("Failed to extract output tensor: {e}")))?
        };

        let output_shape = output_tensor.shape().to_vec();
        if output_shape.len() != 4 {
            return Err(RelightError::processing(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        }

        let result = Array4::from_shape_vec(
            (
                output_shape.first().copied().unwrap_or(1),
                output_shape.get(1).copied().unwrap_or(1),
                output_shape.get(2).copied().unwrap_or(1),
                output_shape.get(3).copied().unwrap_or(1),
            ),
            output_tensor.view().to_owned().into_raw_vec_and_offset().0,
        )
        .map_err(|e| RelightError::processing(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "Matting inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(result)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_infer_before_initialize_fails() {
        let mut backend = OnnxBackend::new("missing.onnx");
        assert!(!backend.is_initialized());
        let input = Array4::<f32>::zeros((1, 3, 64, 64));
        assert!(backend.infer(&input).is_err());
    }

    #[test]
    fn test_initialize_rejects_invalid_model_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.onnx");
        std::fs::write(&path, b"not an onnx graph").unwrap();

        let mut backend = OnnxBackend::new(&path);
        let config = RelightConfig::builder()
            .execution_provider(ExecutionProvider::Cpu)
            .build()
            .unwrap();
        assert!(backend.initialize(&config).is_err());
        assert!(!backend.is_initialized());
        assert_eq!(backend.model_path(), path.as_path());
    }

    #[test]
    fn test_cpu_provider_always_listed() {
        let providers = OnnxBackend::list_providers();
        assert!(providers.iter().any(|(name, available, _)| name == "CPU" && *available));
    }
}
