//! Tract backend for the RMBG matting network
//!
//! Pure Rust inference. The matting input size depends on the aspect ratio
//! of each portrait, so one optimized plan is built per input shape and kept
//! for later images of the same shape.

use crate::config::RelightConfig;
use crate::error::{RelightError, Result};
use crate::inference::InferenceBackend;
use ndarray::Array4;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

use instant::{Duration, Instant};

type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

type InputShape = (usize, usize, usize, usize);

/// Tract backend for running the matting model
#[derive(Debug)]
pub struct TractBackend {
    model_path: PathBuf,
    graph: Option<InferenceModel>,
    plans: HashMap<InputShape, TractModel>,
    initialized: bool,
}

impl TractBackend {
    #[must_use]
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            graph: None,
            plans: HashMap::new(),
            initialized: false,
        }
    }

    /// Number of input shapes with an optimized plan
    #[must_use]
    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();

        let graph = onnx().model_for_path(&self.model_path).map_err(|e| {
            RelightError::model_error_with_context(
                "load",
                &self.model_path,
                &e.to_string(),
                &["check that the file is the RMBG-1.4 ONNX export"],
            )
        })?;

        self.graph = Some(graph);
        self.plans.clear();
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Tract matting graph loaded in {:.0}ms ({})",
            model_load_time.as_secs_f64() * 1000.0,
            self.model_path.display()
        );
        Ok(model_load_time)
    }

    fn plan_for(&mut self, shape: InputShape) -> Result<&TractModel> {
        if !self.plans.contains_key(&shape) {
            let graph = self
                .graph
                .as_ref()
                .ok_or_else(|| RelightError::inference("Tract model not initialized"))?;

            log::debug!("Optimizing tract plan for input {:?}", shape);
            let (n, c, h, w) = shape;
            let plan = graph
                .clone()
                .with_input_fact(0, f32::fact([n, c, h, w]).into())
                .and_then(|model| model.into_optimized())
                .and_then(|model| model.into_runnable())
                .map_err(|e| RelightError::model(format!("Failed to prepare tract plan: {e}")))?;
            self.plans.insert(shape, plan);
        }

        self.plans
            .get(&shape)
            .ok_or_else(|| RelightError::internal("Tract plan missing after insertion"))
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, _config: &RelightConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model()?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let inference_start = Instant::now();
        let model = self.plan_for(input.dim())?;

        let input_tensor = Tensor::from(input.clone());
        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| RelightError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| RelightError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_data = output_tensor
            .to_array_view::<f32>()
            .map_err(|e| RelightError::inference(format!("Failed to convert output tensor: {e}")))?;

        let output_shape = output_data.shape();
        if output_shape.len() != 4 {
            return Err(RelightError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        }

        let output_array = Array4::from_shape_vec(
            (
                output_shape.first().copied().unwrap_or(1),
                output_shape.get(1).copied().unwrap_or(1),
                output_shape.get(2).copied().unwrap_or(1),
                output_shape.get(3).copied().unwrap_or(1),
            ),
            output_data.to_owned().into_raw_vec_and_offset().0,
        )
        .map_err(|e| RelightError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "Tract matting inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(output_array)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn name(&self) -> &'static str {
        "tract"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_before_initialize_fails() {
        let mut backend = TractBackend::new("missing.onnx");
        let input = Array4::<f32>::zeros((1, 3, 64, 64));
        assert!(backend.infer(&input).is_err());
        assert_eq!(backend.cached_plans(), 0);
    }

    #[test]
    fn test_missing_model_file_is_model_error() {
        let mut backend = TractBackend::new("/nonexistent/rmbg.onnx");
        let err = backend.initialize(&RelightConfig::default()).unwrap_err();
        assert!(matches!(err, RelightError::Model(_)));
        assert!(!backend.is_initialized());
    }
}
