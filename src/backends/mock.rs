//! Mock backends for testing and debugging
//!
//! Deterministic stand-ins for the matting network and the diffusion model,
//! usable without any model files. Clones share their call history.

use crate::{
    config::RelightConfig,
    error::{RelightError, Result},
    inference::{DiffusionBackend, InferenceBackend, SamplingRequest},
    text::{chunk_token_ids, MAX_LENGTH},
};
use instant::Duration;
use ndarray::{Array3, Array4};
use std::sync::{Arc, Mutex};

/// Hidden size of the mock text encoder
pub const MOCK_TEXT_DIM: usize = 8;

/// Spatial downsampling factor of the mock VAE
pub const MOCK_LATENT_FACTOR: usize = 8;

const BOS: u32 = 1;
const EOS: u32 = 2;

fn record(history: &Arc<Mutex<Vec<String>>>, entry: String) {
    if let Ok(mut calls) = history.lock() {
        calls.push(entry);
    }
}

fn snapshot(history: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    history.lock().map(|calls| calls.clone()).unwrap_or_default()
}

/// Matte pattern produced by `MockMattingBackend`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MattePattern {
    /// Same value everywhere
    Constant(f32),
    /// 1.0 inside the central half of the frame, 0.0 outside
    CenterBox,
}

/// Mock matting backend
#[derive(Debug, Clone)]
pub struct MockMattingBackend {
    pattern: MattePattern,
    initialized: bool,
    call_history: Arc<Mutex<Vec<String>>>,
    should_fail_init: bool,
    should_fail_inference: bool,
}

impl MockMattingBackend {
    /// Create a mock that predicts a constant matte
    #[must_use]
    pub fn constant(value: f32) -> Self {
        Self::with_pattern(MattePattern::Constant(value))
    }

    /// Create a mock that predicts a centered foreground box
    #[must_use]
    pub fn center_box() -> Self {
        Self::with_pattern(MattePattern::CenterBox)
    }

    #[must_use]
    pub fn with_pattern(pattern: MattePattern) -> Self {
        Self {
            pattern,
            initialized: false,
            call_history: Arc::new(Mutex::new(Vec::new())),
            should_fail_init: false,
            should_fail_inference: false,
        }
    }

    /// Create a mock backend that will fail during initialization
    #[must_use]
    pub fn new_failing_init() -> Self {
        let mut backend = Self::constant(1.0);
        backend.should_fail_init = true;
        backend
    }

    /// Create a mock backend that will fail during inference
    #[must_use]
    pub fn new_failing_inference() -> Self {
        let mut backend = Self::constant(1.0);
        backend.should_fail_inference = true;
        backend
    }

    /// Get the call history for verification in tests
    #[must_use]
    pub fn get_call_history(&self) -> Vec<String> {
        snapshot(&self.call_history)
    }
}

impl Default for MockMattingBackend {
    fn default() -> Self {
        Self::constant(1.0)
    }
}

impl InferenceBackend for MockMattingBackend {
    fn initialize(&mut self, _config: &RelightConfig) -> Result<Option<Duration>> {
        record(&self.call_history, "initialize".to_string());
        if self.should_fail_init {
            return Err(RelightError::model("Mock matting initialization failure"));
        }
        self.initialized = true;
        Ok(None)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        record(&self.call_history, format!("infer {}x{}x{}x{}", n, c, h, w));
        if !self.initialized {
            return Err(RelightError::internal("Backend not initialized"));
        }
        if self.should_fail_inference {
            return Err(RelightError::inference("Mock matting inference failure"));
        }

        let output = match self.pattern {
            MattePattern::Constant(value) => Array4::from_elem((1, 1, h, w), value),
            MattePattern::CenterBox => Array4::from_shape_fn((1, 1, h, w), |(_, _, y, x)| {
                let inside_y = y >= h / 4 && y < h - h / 4;
                let inside_x = x >= w / 4 && x < w - w / 4;
                if inside_y && inside_x {
                    1.0
                } else {
                    0.0
                }
            }),
        };
        Ok(output)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn name(&self) -> &'static str {
        "mock-matting"
    }
}

/// Mock diffusion backend
///
/// Text is hashed word by word into pseudo token ids, images are block
/// averaged into latents and decoded by nearest upsampling, and sampling is a
/// fixed blend of the conditioning latent, the starting latent and a small
/// amount of the supplied noise. Identical requests give identical outputs.
#[derive(Debug, Clone, Default)]
pub struct MockDiffusionBackend {
    call_history: Arc<Mutex<Vec<String>>>,
    fail_on_sample: Option<usize>,
}

impl MockDiffusionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose `n`-th `sample` call (zero-based) fails
    #[must_use]
    pub fn failing_on_sample(n: usize) -> Self {
        Self {
            fail_on_sample: Some(n),
            ..Self::default()
        }
    }

    /// Get the call history for verification in tests
    #[must_use]
    pub fn get_call_history(&self) -> Vec<String> {
        snapshot(&self.call_history)
    }

    /// Number of `sample` calls made so far
    #[must_use]
    pub fn sample_calls(&self) -> usize {
        self.get_call_history()
            .iter()
            .filter(|entry| entry.starts_with("sample"))
            .count()
    }

    /// Prompts passed to `encode_text`, in call order
    #[must_use]
    pub fn encoded_prompts(&self) -> Vec<String> {
        self.get_call_history()
            .iter()
            .filter(|entry| entry.starts_with("encode_text"))
            .filter_map(|entry| entry.split_once(" prompt=").map(|(_, prompt)| prompt.to_string()))
            .collect()
    }

    fn pseudo_token(word: &str) -> u32 {
        word.bytes()
            .fold(17_u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)))
            % 1000
            + 3
    }
}

impl DiffusionBackend for MockDiffusionBackend {
    fn encode_text(&self, prompt: &str) -> Result<Array3<f32>> {
        let tokens: Vec<u32> = prompt.split_whitespace().map(Self::pseudo_token).collect();
        let chunks = chunk_token_ids(&tokens, BOS, EOS);
        record(
            &self.call_history,
            format!("encode_text chunks={} prompt={}", chunks.len(), prompt),
        );

        Ok(Array3::from_shape_fn(
            (chunks.len(), MAX_LENGTH, MOCK_TEXT_DIM),
            |(chunk, token, dim)| {
                let id = chunks[chunk][token] as f32;
                ((id * (dim as f32 + 1.0)) % 97.0) / 97.0
            },
        ))
    }

    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = pixels.dim();
        record(&self.call_history, format!("encode_image {}x{}x{}x{}", n, c, h, w));
        if c != 3 || h % MOCK_LATENT_FACTOR != 0 || w % MOCK_LATENT_FACTOR != 0 {
            return Err(RelightError::inference(format!(
                "Mock VAE expects (n, 3, 8k, 8k) input, got {:?}",
                pixels.dim()
            )));
        }

        let (lh, lw) = (h / MOCK_LATENT_FACTOR, w / MOCK_LATENT_FACTOR);
        let block = (MOCK_LATENT_FACTOR * MOCK_LATENT_FACTOR) as f32;
        Ok(Array4::from_shape_fn((n, 4, lh, lw), |(b, ch, y, x)| {
            let channels = if ch < 3 { ch..ch + 1 } else { 0..3 };
            let width = channels.len() as f32;
            let mut sum = 0.0;
            for src in channels {
                for dy in 0..MOCK_LATENT_FACTOR {
                    for dx in 0..MOCK_LATENT_FACTOR {
                        sum += pixels[[b, src, y * MOCK_LATENT_FACTOR + dy, x * MOCK_LATENT_FACTOR + dx]];
                    }
                }
            }
            sum / (block * width)
        }))
    }

    fn decode_latent(&self, latents: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = latents.dim();
        record(&self.call_history, format!("decode_latent {}x{}x{}x{}", n, c, h, w));
        if c != 4 {
            return Err(RelightError::inference(format!(
                "Mock VAE expects 4 latent channels, got {}",
                c
            )));
        }
        Ok(Array4::from_shape_fn(
            (n, 3, h * MOCK_LATENT_FACTOR, w * MOCK_LATENT_FACTOR),
            |(b, ch, y, x)| {
                latents[[b, ch, y / MOCK_LATENT_FACTOR, x / MOCK_LATENT_FACTOR]].clamp(-1.0, 1.0)
            },
        ))
    }

    fn sample(&self, request: &SamplingRequest<'_>) -> Result<Array4<f32>> {
        let calls_before = self.sample_calls();
        record(
            &self.call_history,
            format!(
                "sample batch={} steps={} start={} img2img={}",
                request.batch_size(),
                request.num_inference_steps,
                request.start_step,
                request.init_latents.is_some()
            ),
        );
        if self.fail_on_sample == Some(calls_before) {
            return Err(RelightError::inference("Mock sampling failure"));
        }

        let (n, c, h, w) = request.noise.dim();
        let (_, concat_channels, ch, cw) = request.concat.dim();
        if c != 4 || concat_channels != 8 || (ch, cw) != (h, w) {
            return Err(RelightError::inference(format!(
                "Mock sampler shape mismatch: noise {:?}, concat {:?}",
                request.noise.dim(),
                request.concat.dim()
            )));
        }
        if request.positive.dim() != request.negative.dim() {
            return Err(RelightError::inference("Mock sampler text conditioning mismatch"));
        }
        if let Some(init) = request.init_latents {
            if init.dim() != request.noise.dim() {
                return Err(RelightError::inference("Mock sampler init latent mismatch"));
            }
        }

        let guidance = (request.positive.mean().unwrap_or(0.0) - request.negative.mean().unwrap_or(0.0))
            * request.guidance_scale as f32
            * 0.01;
        let progress = if request.num_inference_steps == 0 {
            0.0
        } else {
            request.steps_to_run() as f32 / request.num_inference_steps as f32
        };

        Ok(Array4::from_shape_fn((n, c, h, w), |(b, ch_idx, y, x)| {
            let fg = request.concat[[0, ch_idx, y, x]];
            let bg = request.concat[[0, ch_idx + 4, y, x]];
            let conditioned = 0.7 * fg + 0.3 * bg + guidance;
            let noise = 0.05 * request.noise[[b, ch_idx, y, x]];
            match request.init_latents {
                Some(init) => {
                    let start = init[[b, ch_idx, y, x]];
                    start + (conditioned - start) * progress + noise
                },
                None => conditioned + noise,
            }
        }))
    }

    fn name(&self) -> &'static str {
        "mock-diffusion"
    }
}
