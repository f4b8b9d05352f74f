//! Relighting processor
//!
//! `RelightProcessor` owns the loaded backends and runs the two-stage
//! generation (base pass, then an image-to-image highres pass), the plain
//! relight flow and the four-pass normal estimation flow.

use crate::{
    background::BackgroundSynthesizer,
    config::{LightingPreset, RelightConfig, RELIGHT_BRIGHTNESS_BIAS},
    error::{RelightError, Result},
    inference::{
        img2img_schedule_length, img2img_start_index, DiffusionBackend, InferenceBackend,
        SamplingRequest,
    },
    matting::ForegroundExtractor,
    normal::{DirectionalPasses, NormalMapEstimator},
    types::{AlphaMatte, FloatImage, GenerationRequest, GenerationResult},
    utils::ImagePreprocessor,
};
use image::RgbImage;
use instant::Instant;
use log::{debug, info};
use ndarray::{concatenate, s, Array3, Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{info as trace_info, instrument, span, Level};

/// Light directions of the normal estimation passes, in execution order
pub const NORMAL_PASS_ORDER: [LightingPreset; 4] = [
    LightingPreset::Left,
    LightingPreset::Right,
    LightingPreset::Bottom,
    LightingPreset::Top,
];

/// Draw a standard normal tensor from the shared generator
fn standard_normal(rng: &mut StdRng, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    Array4::from_shape_simple_fn(shape, || rng.sample::<f32, _>(StandardNormal))
}

/// Encoded text conditioning for one request
struct TextConditioning {
    positive: Array3<f32>,
    negative: Array3<f32>,
}

/// Relighting processor over a diffusion backend and a matting backend
pub struct RelightProcessor {
    config: RelightConfig,
    diffusion: Box<dyn DiffusionBackend>,
    matting: Box<dyn InferenceBackend>,
}

impl RelightProcessor {
    /// Create a processor from already loaded backends
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(
        config: RelightConfig,
        diffusion: Box<dyn DiffusionBackend>,
        matting: Box<dyn InferenceBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            diffusion,
            matting,
        })
    }

    /// Initialize the matting backend
    ///
    /// # Errors
    /// - Matting model loading failures
    pub fn initialize(&mut self) -> Result<()> {
        if self.matting.is_initialized() {
            return Ok(());
        }
        info!("Initializing matting backend: {}", self.matting.name());
        if let Some(load_time) = self.matting.initialize(&self.config)? {
            debug!("Matting model loaded in {:.0}ms", load_time.as_secs_f64() * 1000.0);
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &RelightConfig {
        &self.config
    }

    /// Strip the background of `image`, compositing with brightness bias `sigma`
    ///
    /// # Errors
    /// - Matting failures
    pub fn extract_foreground(&mut self, image: &RgbImage, sigma: f32) -> Result<(RgbImage, AlphaMatte)> {
        self.initialize()?;
        ForegroundExtractor::new(self.matting.as_mut()).remove_background(image, sigma)
    }

    fn encode_prompts(&self, request: &GenerationRequest) -> Result<TextConditioning> {
        let positive = self.diffusion.encode_text(&request.positive_prompt())?;
        let negative = self.diffusion.encode_text(&request.params.negative_prompt)?;
        let (positive, negative) = crate::text::balance_prompt_pair(&positive, &negative)?;
        Ok(TextConditioning { positive, negative })
    }

    /// Encode foreground and background and stack their latents along channels
    fn encode_condition(&self, foreground: &RgbImage, background: &RgbImage) -> Result<Array4<f32>> {
        let pixels = ImagePreprocessor::images_to_tensor(&[foreground.clone(), background.clone()])?;
        let latents = self.diffusion.encode_image(&pixels)?;
        if latents.dim().0 != 2 {
            return Err(RelightError::processing_stage_error(
                "condition_encoding",
                &format!("expected 2 latents, got {}", latents.dim().0),
                None,
            ));
        }
        Ok(concatenate(
            Axis(1),
            &[latents.slice(s![0..1, .., .., ..]), latents.slice(s![1..2, .., .., ..])],
        )?)
    }

    /// Run the two-stage generation for a composited foreground
    ///
    /// # Errors
    /// - Background synthesis failures
    /// - Any backend failure in either pass
    #[instrument(
        skip(self, request),
        fields(
            backend = self.diffusion.name(),
            preset = %request.preset.variant_name(),
            seed = request.params.seed,
            samples = request.params.num_samples
        )
    )]
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let params = &request.params;
        let total_start = Instant::now();
        let mut rng = StdRng::seed_from_u64(params.seed);

        let background = BackgroundSynthesizer::synthesize(
            request.preset,
            request.uploaded_background.as_ref(),
            params.width,
            params.height,
        )?;
        let text = self.encode_prompts(request)?;

        // Base pass
        let base_images = {
            let _span = span!(
                Level::INFO,
                "generation_pass",
                stage = "base",
                width = params.width,
                height = params.height,
                steps = params.steps
            )
            .entered();

            let foreground =
                ImagePreprocessor::resize_and_center_crop(&request.foreground, params.width, params.height);
            let background_fit =
                ImagePreprocessor::resize_and_center_crop(&background, params.width, params.height);
            let concat = self.encode_condition(&foreground, &background_fit)?;
            let (_, _, latent_height, latent_width) = concat.dim();

            let noise = standard_normal(&mut rng, (params.num_samples, 4, latent_height, latent_width));
            let latents = self.diffusion.sample(&SamplingRequest {
                positive: &text.positive,
                negative: &text.negative,
                concat: &concat,
                init_latents: None,
                noise: &noise,
                num_inference_steps: params.steps,
                start_step: 0,
                guidance_scale: params.cfg,
            })?;
            let pixels = self.diffusion.decode_latent(&latents)?;
            ImagePreprocessor::tensor_to_images(&pixels)?
        };

        // Highres pass
        let (samples, foreground, background_fit) = {
            let (target_width, target_height) =
                ImagePreprocessor::highres_dimensions(params.width, params.height, params.highres_scale);
            let _span = span!(
                Level::INFO,
                "generation_pass",
                stage = "highres",
                width = target_width,
                height = target_height,
                denoise = params.highres_denoise
            )
            .entered();

            let upscaled: Vec<RgbImage> = base_images
                .iter()
                .map(|image| ImagePreprocessor::resize_without_crop(image, target_width, target_height))
                .collect();
            let init_latents = self
                .diffusion
                .encode_image(&ImagePreprocessor::images_to_tensor(&upscaled)?)?;
            let (_, _, latent_height, latent_width) = init_latents.dim();
            let (width, height) = ((latent_width * 8) as u32, (latent_height * 8) as u32);

            let foreground = ImagePreprocessor::resize_and_center_crop(&request.foreground, width, height);
            let background_fit = ImagePreprocessor::resize_and_center_crop(&background, width, height);
            let concat = self.encode_condition(&foreground, &background_fit)?;

            let num_inference_steps = img2img_schedule_length(params.steps, params.highres_denoise);
            let start_step = img2img_start_index(num_inference_steps, params.highres_denoise);
            debug!(
                "Highres schedule: {} steps, starting at {}",
                num_inference_steps, start_step
            );

            let noise = standard_normal(&mut rng, init_latents.dim());
            let latents = self.diffusion.sample(&SamplingRequest {
                positive: &text.positive,
                negative: &text.negative,
                concat: &concat,
                init_latents: Some(&init_latents),
                noise: &noise,
                num_inference_steps,
                start_step,
                guidance_scale: params.cfg,
            })?;
            let pixels = self.diffusion.decode_latent(&latents)?;
            (
                ImagePreprocessor::tensor_to_float_images(&pixels)?,
                foreground,
                background_fit,
            )
        };

        trace_info!(
            elapsed_ms = total_start.elapsed().as_millis() as u64,
            samples = samples.len(),
            "Generation complete"
        );

        Ok(GenerationResult {
            samples,
            foreground,
            background: background_fit,
        })
    }

    /// Extract the foreground and relight it
    ///
    /// Returns the quantized samples followed by the highres foreground and
    /// background conditioning images.
    ///
    /// # Errors
    /// - Matting or generation failures
    pub fn relight(&mut self, request: &GenerationRequest) -> Result<Vec<RgbImage>> {
        let (foreground, _matte) = self.extract_foreground(&request.foreground, RELIGHT_BRIGHTNESS_BIAS)?;
        let result = self.generate(&request.with_pass(foreground, request.preset, request.params.num_samples))?;

        let mut outputs: Vec<RgbImage> = result.samples.iter().map(ImagePreprocessor::float_to_rgb).collect();
        outputs.push(result.foreground);
        outputs.push(result.background);
        Ok(outputs)
    }

    /// Estimate a normal map from four directional relighting passes
    ///
    /// Returns the normal map, the four lighting ratios and the four raw
    /// passes. A failing pass aborts the whole estimation.
    ///
    /// # Errors
    /// - Matting, generation or estimation failures
    pub fn estimate_normals(&mut self, request: &GenerationRequest) -> Result<Vec<RgbImage>> {
        let (foreground, matte) = self.extract_foreground(&request.foreground, self.config.normal_bias)?;

        let mut passes: Vec<FloatImage> = Vec::with_capacity(NORMAL_PASS_ORDER.len());
        for preset in NORMAL_PASS_ORDER {
            info!("Running {} pass", preset);
            let result = self.generate(&request.with_pass(foreground.clone(), preset, 1))?;
            let sample = result.samples.into_iter().next().ok_or_else(|| {
                RelightError::processing_stage_error(preset.variant_name(), "pass produced no sample", None)
            })?;
            passes.push(sample);
        }

        let [left, right, bottom, top] = passes.as_slice() else {
            return Err(RelightError::internal("Expected four directional passes"));
        };
        NormalMapEstimator::new(self.config.normal_sharpness).estimate(
            DirectionalPasses {
                left,
                right,
                bottom,
                top,
            },
            &matte,
        )
    }
}
