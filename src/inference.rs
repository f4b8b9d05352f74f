//! Inference backend abstractions
//!
//! Two seams separate the orchestration from the model runtimes:
//! - `InferenceBackend` runs the matting network (ONNX Runtime or Tract)
//! - `DiffusionBackend` exposes the text encoder, the VAE and the
//!   conditioned denoising loop of the relighting model

use crate::{config::RelightConfig, error::Result};
use ndarray::{Array3, Array4};

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Trait for matting inference backends
pub trait InferenceBackend {
    /// Initialize the backend with the given configuration
    ///
    /// # Errors
    /// - Backend initialization failures
    /// - Model loading or validation errors
    fn initialize(&mut self, config: &RelightConfig) -> Result<Option<Duration>>;

    /// Run the matting network on an NCHW tensor, returning a (1, 1, h, w) matte
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Invalid input tensor dimensions
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// One denoising run handed to a `DiffusionBackend`
///
/// All randomness is supplied here so that the backend itself stays
/// deterministic.
#[derive(Debug, Clone, Copy)]
pub struct SamplingRequest<'a> {
    /// Positive text conditioning, (1, tokens, dim)
    pub positive: &'a Array3<f32>,
    /// Negative text conditioning, (1, tokens, dim)
    pub negative: &'a Array3<f32>,
    /// Foreground + background conditioning latent, (1, 8, h, w)
    pub concat: &'a Array4<f32>,
    /// Starting latents for image-to-image sampling, (n, 4, h, w)
    pub init_latents: Option<&'a Array4<f32>>,
    /// Standard normal noise, (n, 4, h, w)
    pub noise: &'a Array4<f32>,
    /// Length of the scheduler's timestep table
    pub num_inference_steps: usize,
    /// Index of the first timestep to run
    pub start_step: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
}

impl SamplingRequest<'_> {
    /// Number of latents produced
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.noise.dim().0
    }

    /// Timesteps actually executed
    #[must_use]
    pub fn steps_to_run(&self) -> usize {
        self.num_inference_steps.saturating_sub(self.start_step)
    }
}

/// Capability interface of the conditioned diffusion model
pub trait DiffusionBackend {
    /// Encode a prompt into per-chunk hidden states, (chunks, 77, dim)
    ///
    /// # Errors
    /// - Tokenizer or text encoder failures
    fn encode_text(&self, prompt: &str) -> Result<Array3<f32>>;

    /// Encode NCHW pixels in [-1, 1] into scaled latents, (n, 4, h/8, w/8)
    ///
    /// # Errors
    /// - VAE encoder failures
    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Array4<f32>>;

    /// Decode scaled latents into NCHW pixels in [-1, 1]
    ///
    /// # Errors
    /// - VAE decoder failures
    fn decode_latent(&self, latents: &Array4<f32>) -> Result<Array4<f32>>;

    /// Run the guided denoising loop
    ///
    /// # Errors
    /// - UNet or scheduler failures
    /// - Shape mismatches between request tensors
    fn sample(&self, request: &SamplingRequest<'_>) -> Result<Array4<f32>>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Index of the first executed timestep for image-to-image sampling
///
/// `n - min(floor(n * strength), n)`: the lower the strength, the later the
/// denoising starts.
#[must_use]
pub fn img2img_start_index(num_inference_steps: usize, strength: f64) -> usize {
    let n = num_inference_steps;
    let init_timestep = ((n as f64 * strength).floor().max(0.0) as usize).min(n);
    n - init_timestep
}

/// Timestep table length of the highres pass: `round(steps / denoise)`
#[must_use]
pub fn img2img_schedule_length(steps: usize, denoise: f64) -> usize {
    ((steps as f64 / denoise).round_ties_even() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_img2img_start_index() {
        assert_eq!(img2img_start_index(50, 0.5), 25);
        assert_eq!(img2img_start_index(50, 1.0), 0);
        assert_eq!(img2img_start_index(10, 0.33), 7);
        assert_eq!(img2img_start_index(10, 2.0), 0);
        assert_eq!(img2img_start_index(10, 0.0), 10);
    }

    #[test]
    fn test_schedule_length() {
        assert_eq!(img2img_schedule_length(25, 0.5), 50);
        assert_eq!(img2img_schedule_length(25, 1.0), 25);
        assert_eq!(img2img_schedule_length(10, 0.3), 33);
    }

    #[test]
    fn test_sampling_request_helpers() {
        let text = Array3::<f32>::zeros((1, 77, 8));
        let concat = Array4::<f32>::zeros((1, 8, 2, 2));
        let noise = Array4::<f32>::zeros((3, 4, 2, 2));
        let request = SamplingRequest {
            positive: &text,
            negative: &text,
            concat: &concat,
            init_latents: None,
            noise: &noise,
            num_inference_steps: 50,
            start_step: 25,
            guidance_scale: 2.0,
        };
        assert_eq!(request.batch_size(), 3);
        assert_eq!(request.steps_to_run(), 25);
    }
}
