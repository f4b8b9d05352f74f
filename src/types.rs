//! Core types for relighting operations

use crate::{
    config::{GenerationParams, LightingPreset},
    error::{RelightError, Result},
};
use image::{imageops::FilterType, GrayImage, RgbImage};
use ndarray::{Array2, Array3};

/// Un-quantized image shaped (height, width, 3) with values in [0, 1]
pub type FloatImage = Array3<f32>;

/// Single-channel foreground matte in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaMatte {
    data: Array2<f32>,
}

impl AlphaMatte {
    /// Wrap a (height, width) array, clipping values to [0, 1]
    #[must_use]
    pub fn new(data: Array2<f32>) -> Self {
        Self {
            data: data.mapv(|v| v.clamp(0.0, 1.0)),
        }
    }

    /// Matte of constant value
    #[must_use]
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self::new(Array2::from_elem((height as usize, width as usize), value))
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    /// Matte value at (x, y)
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        self.data.get((y as usize, x as usize)).copied()
    }

    #[must_use]
    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    /// Quantize to an 8-bit grayscale image (`x * 255`, clipped, truncated)
    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width(), self.height(), |x, y| {
            let value = self.data[[y as usize, x as usize]];
            image::Luma([(value * 255.0).clamp(0.0, 255.0) as u8])
        })
    }

    /// Bring the matte to a target resolution the way output conditioning
    /// images are produced: quantize, resize with center crop, divide by 255
    ///
    /// # Errors
    /// - Zero target dimensions
    pub fn resized_for_output(&self, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RelightError::invalid_config(format!(
                "Cannot resize matte to {}x{}",
                width, height
            )));
        }
        let gray = self.to_gray_image();
        let resized = crate::utils::ImagePreprocessor::resize_and_center_crop_with(
            &gray,
            width,
            height,
            FilterType::Lanczos3,
        );
        let data = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            f32::from(resized.get_pixel(x as u32, y as u32)[0]) / 255.0
        });
        Ok(Self { data })
    }
}

/// Inputs of one two-stage generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Composited foreground (background already stripped)
    pub foreground: RgbImage,
    /// Background used by the upload presets
    pub uploaded_background: Option<RgbImage>,
    /// Item prompt
    pub prompt: String,
    /// Lighting preset selecting the synthetic background
    pub preset: LightingPreset,
    /// Sampling parameters
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Create a builder for a request over the given foreground
    #[must_use]
    pub fn builder(foreground: RgbImage) -> GenerationRequestBuilder {
        GenerationRequestBuilder::new(foreground)
    }

    /// Full positive prompt: `prompt + ", " + added_prompt`
    #[must_use]
    pub fn positive_prompt(&self) -> String {
        format!("{}, {}", self.prompt, self.params.added_prompt)
    }

    /// Copy of this request with a different foreground, preset and sample count
    #[must_use]
    pub fn with_pass(&self, foreground: RgbImage, preset: LightingPreset, num_samples: usize) -> Self {
        let mut next = self.clone();
        next.foreground = foreground;
        next.preset = preset;
        next.params.num_samples = num_samples;
        next
    }
}

/// Builder for `GenerationRequest`
#[derive(Debug)]
pub struct GenerationRequestBuilder {
    request: GenerationRequest,
}

impl GenerationRequestBuilder {
    #[must_use]
    pub fn new(foreground: RgbImage) -> Self {
        Self {
            request: GenerationRequest {
                foreground,
                uploaded_background: None,
                prompt: String::new(),
                preset: LightingPreset::CustomGray,
                params: GenerationParams::default(),
            },
        }
    }

    #[must_use]
    pub fn prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.request.prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn preset(mut self, preset: LightingPreset) -> Self {
        self.request.preset = preset;
        self
    }

    #[must_use]
    pub fn uploaded_background(mut self, background: Option<RgbImage>) -> Self {
        self.request.uploaded_background = background;
        self
    }

    #[must_use]
    pub fn params(mut self, params: GenerationParams) -> Self {
        self.request.params = params;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.request.params.seed = seed;
        self
    }

    #[must_use]
    pub fn num_samples(mut self, num_samples: usize) -> Self {
        self.request.params.num_samples = num_samples;
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: usize) -> Self {
        self.request.params.steps = steps;
        self
    }

    #[must_use]
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.request.params.width = width;
        self.request.params.height = height;
        self
    }

    /// Build the request
    ///
    /// # Errors
    /// - Invalid generation parameters
    /// - Empty foreground image
    /// - Upload preset without an uploaded background
    pub fn build(self) -> Result<GenerationRequest> {
        let request = self.request;
        request.params.validate()?;
        if request.foreground.width() == 0 || request.foreground.height() == 0 {
            return Err(RelightError::invalid_config("Foreground image is empty"));
        }
        if request.preset.needs_upload() && request.uploaded_background.is_none() {
            return Err(RelightError::invalid_config(format!(
                "Preset '{}' requires a background image (--bg_image)",
                request.preset
            )));
        }
        Ok(request)
    }
}

/// Output of one two-stage generation call
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Highres samples, (height, width, 3) in [0, 1]
    pub samples: Vec<FloatImage>,
    /// Foreground conditioning image at highres size
    pub foreground: RgbImage,
    /// Background conditioning image at highres size
    pub background: RgbImage,
}

impl GenerationResult {
    /// Highres output dimensions (width, height)
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.foreground.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_matte_clips_values() {
        let matte = AlphaMatte::new(Array2::from_shape_vec((1, 3), vec![-0.5, 0.25, 1.5]).unwrap());
        assert_eq!(matte.get(0, 0), Some(0.0));
        assert_eq!(matte.get(1, 0), Some(0.25));
        assert_eq!(matte.get(2, 0), Some(1.0));
        assert_eq!(matte.get(3, 0), None);
        assert_eq!((matte.width(), matte.height()), (3, 1));
    }

    #[test]
    fn test_alpha_matte_quantization_truncates() {
        let matte = AlphaMatte::filled(2, 2, 0.5);
        let gray = matte.to_gray_image();
        assert_eq!(gray.get_pixel(1, 1)[0], 127);
    }

    #[test]
    fn test_resized_for_output_keeps_constant_mattes() {
        let matte = AlphaMatte::filled(40, 30, 1.0);
        let resized = matte.resized_for_output(16, 16).unwrap();
        assert_eq!((resized.width(), resized.height()), (16, 16));
        assert!(resized.as_array().iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(matte.resized_for_output(0, 16).is_err());
    }

    #[test]
    fn test_request_builder_validation() {
        let fg = RgbImage::new(8, 8);
        let request = GenerationRequest::builder(fg.clone())
            .prompt("portrait")
            .preset(LightingPreset::Left)
            .seed(42)
            .build()
            .unwrap();
        assert_eq!(request.params.seed, 42);
        assert_eq!(request.positive_prompt(), "portrait, best quality");

        let err = GenerationRequest::builder(fg.clone())
            .preset(LightingPreset::Upload)
            .build()
            .unwrap_err();
        assert!(matches!(err, RelightError::InvalidConfig(_)));

        assert!(GenerationRequest::builder(RgbImage::new(0, 0)).build().is_err());
        assert!(GenerationRequest::builder(fg).steps(0).build().is_err());
    }

    #[test]
    fn test_with_pass_overrides_only_pass_fields() {
        let request = GenerationRequest::builder(RgbImage::new(8, 8))
            .prompt("portrait")
            .num_samples(3)
            .build()
            .unwrap();
        let pass = request.with_pass(RgbImage::new(4, 4), LightingPreset::Top, 1);
        assert_eq!(pass.preset, LightingPreset::Top);
        assert_eq!(pass.params.num_samples, 1);
        assert_eq!(pass.foreground.dimensions(), (4, 4));
        assert_eq!(pass.prompt, "portrait");
    }
}
