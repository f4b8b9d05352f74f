//! Configuration types for relighting operations

use crate::error::{RelightError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default positive prompt suffix
pub const DEFAULT_ADDED_PROMPT: &str = "best quality";

/// Default negative prompt
pub const DEFAULT_NEGATIVE_PROMPT: &str = "fog, haze, faded, washed-out, lowres, bad anatomy, bad hands, cropped, worst quality, illustration, 3d, 2d, painting, cartoons, sketch, shadow, shade";

/// Exponent applied to the estimated normal's z component (halved before use)
pub const NORMAL_SHARPNESS: f32 = 10.0;

/// Brightness bias applied to the foreground before the four directional passes
pub const NORMAL_MODE_BRIGHTNESS_BIAS: f32 = 16.0;

/// Brightness bias applied to the foreground for plain relighting
pub const RELIGHT_BRIGHTNESS_BIAS: f32 = 0.0;

/// Symbolic lighting preference selecting a background synthesis rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LightingPreset {
    Upload,
    UploadFlip,
    Left,
    Right,
    Top,
    Bottom,
    Grey,
    CustomLeft,
    CustomLeftHigh,
    CustomRight,
    CustomRightHigh,
    CustomGray,
}

impl LightingPreset {
    /// Every preset, in declaration order
    pub const ALL: [Self; 12] = [
        Self::Upload,
        Self::UploadFlip,
        Self::Left,
        Self::Right,
        Self::Top,
        Self::Bottom,
        Self::Grey,
        Self::CustomLeft,
        Self::CustomLeftHigh,
        Self::CustomRight,
        Self::CustomRightHigh,
        Self::CustomGray,
    ];

    /// User-facing value, as accepted by `--bg_source`
    #[must_use]
    pub fn display_value(self) -> &'static str {
        match self {
            Self::Upload => "Use Background Image",
            Self::UploadFlip => "Use Flipped Background Image",
            Self::Left => "Left Light",
            Self::Right => "Right Light",
            Self::Top => "Top Light",
            Self::Bottom => "Bottom Light",
            Self::Grey => "Ambient",
            Self::CustomLeft => "CUSTOM_LEFT",
            Self::CustomLeftHigh => "CUSTOM_LEFT_HIGH",
            Self::CustomRight => "CUSTOM_RIGHT",
            Self::CustomRightHigh => "CUSTOM_RIGHT_HIGH",
            Self::CustomGray => "CUSTOM_GRAY",
        }
    }

    /// Symbolic variant name (`UPLOAD`, `LEFT`, ...)
    #[must_use]
    pub fn variant_name(self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::UploadFlip => "UPLOAD_FLIP",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Top => "TOP",
            Self::Bottom => "BOTTOM",
            Self::Grey => "GREY",
            Self::CustomLeft => "CUSTOM_LEFT",
            Self::CustomLeftHigh => "CUSTOM_LEFT_HIGH",
            Self::CustomRight => "CUSTOM_RIGHT",
            Self::CustomRightHigh => "CUSTOM_RIGHT_HIGH",
            Self::CustomGray => "CUSTOM_GRAY",
        }
    }

    /// Whether the preset consumes a user supplied background image
    #[must_use]
    pub fn needs_upload(self) -> bool {
        matches!(self, Self::Upload | Self::UploadFlip)
    }

    /// Map an estimated light-direction label to a preset
    ///
    /// Unknown labels fall back to `CustomGray`.
    #[must_use]
    pub fn from_light_label(label: &str) -> Self {
        match label {
            "Left" => Self::CustomLeft,
            "Left_High" => Self::CustomLeftHigh,
            "Right" => Self::CustomRight,
            "Right_High" => Self::CustomRightHigh,
            _ => Self::CustomGray,
        }
    }
}

impl std::fmt::Display for LightingPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_value())
    }
}

impl FromStr for LightingPreset {
    type Err = RelightError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|preset| {
                preset.display_value() == trimmed
                    || preset.variant_name().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| RelightError::invalid_preset(trimmed))
    }
}

/// Execution device for the inference backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available device (CUDA > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = RelightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            other => Err(RelightError::invalid_config(format!(
                "Unknown execution provider '{}'. Expected one of: auto, cpu, cuda",
                other
            ))),
        }
    }
}

/// Inference engine used for the matting network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// ONNX Runtime (supports GPU acceleration)
    #[default]
    Onnx,
    /// Tract (pure Rust)
    Tract,
}

/// Which flow the batch driver runs per image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelightMode {
    /// Foreground extraction followed by one two-stage generation
    #[default]
    Relight,
    /// Four directional passes merged into a normal map
    Normal,
}

/// Sampling parameters shared by every item of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Base generation width in pixels
    pub width: u32,
    /// Base generation height in pixels
    pub height: u32,
    /// Number of images generated per request
    pub num_samples: usize,
    /// Seed for the sampling noise
    pub seed: u64,
    /// Denoising steps of the base pass
    pub steps: usize,
    /// Classifier-free guidance scale
    pub cfg: f64,
    /// Upscale factor of the highres pass
    pub highres_scale: f64,
    /// Image-to-image strength of the highres pass
    pub highres_denoise: f64,
    /// Appended to the positive prompt
    pub added_prompt: String,
    /// Negative prompt
    pub negative_prompt: String,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: 512,
            height: 640,
            num_samples: 1,
            seed: 12345,
            steps: 25,
            cfg: 2.0,
            highres_scale: 1.5,
            highres_denoise: 0.5,
            added_prompt: DEFAULT_ADDED_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
        }
    }
}

impl GenerationParams {
    /// Validate parameter ranges
    ///
    /// # Errors
    /// - Dimensions that are zero, not multiples of 8 or below 64
    /// - Zero samples or steps
    /// - Non-positive guidance or highres scale
    /// - Highres denoise outside (0, 1]
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("image_width", self.width), ("image_height", self.height)] {
            if value < 64 || value % 8 != 0 {
                return Err(RelightError::config_value_error(
                    name,
                    value,
                    ">= 64 and a multiple of 8",
                    Some(512),
                ));
            }
        }
        if self.num_samples == 0 {
            return Err(RelightError::config_value_error("num_samples", 0, ">= 1", Some(1)));
        }
        if self.steps == 0 {
            return Err(RelightError::config_value_error("steps", 0, ">= 1", Some(25)));
        }
        if !(self.cfg.is_finite() && self.cfg > 0.0) {
            return Err(RelightError::config_value_error("cfg", self.cfg, "> 0", Some(2.0)));
        }
        if !(self.highres_scale.is_finite() && self.highres_scale > 0.0) {
            return Err(RelightError::config_value_error(
                "highres_scale",
                self.highres_scale,
                "> 0",
                Some(1.5),
            ));
        }
        if !(self.highres_denoise > 0.0 && self.highres_denoise <= 1.0) {
            return Err(RelightError::config_value_error(
                "highres_denoise",
                self.highres_denoise,
                "(0, 1]",
                Some(0.5),
            ));
        }
        Ok(())
    }
}

/// Configuration for a relighting session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelightConfig {
    /// Sampling parameters
    pub generation: GenerationParams,
    /// Execution device for the backends
    pub execution_provider: ExecutionProvider,
    /// Engine running the matting network
    pub matting_backend: BackendType,
    /// Flow run per batch item
    pub mode: RelightMode,
    /// Exponent of the normal estimator's z component
    pub normal_sharpness: f32,
    /// Foreground brightness bias used in normal mode
    pub normal_bias: f32,
}

impl Default for RelightConfig {
    fn default() -> Self {
        Self {
            generation: GenerationParams::default(),
            execution_provider: ExecutionProvider::Auto,
            matting_backend: BackendType::Onnx,
            mode: RelightMode::Relight,
            normal_sharpness: NORMAL_SHARPNESS,
            normal_bias: NORMAL_MODE_BRIGHTNESS_BIAS,
        }
    }
}

impl RelightConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> RelightConfigBuilder {
        RelightConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// - Any invalid generation parameter
    /// - Non-finite or negative normal-mode constants
    pub fn validate(&self) -> Result<()> {
        self.generation.validate()?;
        if !(self.normal_sharpness.is_finite() && self.normal_sharpness >= 0.0) {
            return Err(RelightError::config_value_error(
                "normal_sharpness",
                self.normal_sharpness,
                ">= 0",
                Some(NORMAL_SHARPNESS),
            ));
        }
        if !self.normal_bias.is_finite() {
            return Err(RelightError::config_value_error(
                "normal_bias",
                self.normal_bias,
                "finite",
                Some(NORMAL_MODE_BRIGHTNESS_BIAS),
            ));
        }
        Ok(())
    }
}

/// Builder for `RelightConfig`
#[derive(Debug, Default)]
pub struct RelightConfigBuilder {
    config: RelightConfig,
}

impl RelightConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.config.generation.width = width;
        self.config.generation.height = height;
        self
    }

    #[must_use]
    pub fn num_samples(mut self, num_samples: usize) -> Self {
        self.config.generation.num_samples = num_samples;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.generation.seed = seed;
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: usize) -> Self {
        self.config.generation.steps = steps;
        self
    }

    #[must_use]
    pub fn cfg(mut self, cfg: f64) -> Self {
        self.config.generation.cfg = cfg;
        self
    }

    #[must_use]
    pub fn highres(mut self, scale: f64, denoise: f64) -> Self {
        self.config.generation.highres_scale = scale;
        self.config.generation.highres_denoise = denoise;
        self
    }

    #[must_use]
    pub fn added_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.config.generation.added_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn negative_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.config.generation.negative_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn matting_backend(mut self, backend: BackendType) -> Self {
        self.config.matting_backend = backend;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: RelightMode) -> Self {
        self.config.mode = mode;
        self
    }

    #[must_use]
    pub fn normal_sharpness(mut self, sharpness: f32) -> Self {
        self.config.normal_sharpness = sharpness;
        self
    }

    #[must_use]
    pub fn normal_bias(mut self, bias: f32) -> Self {
        self.config.normal_bias = bias;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// - Any validation failure of `RelightConfig::validate`
    pub fn build(self) -> Result<RelightConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_parses_display_and_variant_names() {
        assert_eq!("Left Light".parse::<LightingPreset>().unwrap(), LightingPreset::Left);
        assert_eq!("Ambient".parse::<LightingPreset>().unwrap(), LightingPreset::Grey);
        assert_eq!("UPLOAD_FLIP".parse::<LightingPreset>().unwrap(), LightingPreset::UploadFlip);
        assert_eq!("custom_gray".parse::<LightingPreset>().unwrap(), LightingPreset::CustomGray);
        assert_eq!(
            "CUSTOM_RIGHT_HIGH".parse::<LightingPreset>().unwrap(),
            LightingPreset::CustomRightHigh
        );
    }

    #[test]
    fn test_preset_rejects_unknown_values() {
        let err = "None".parse::<LightingPreset>().unwrap_err();
        assert!(matches!(err, RelightError::InvalidPreset(_)));
        assert!("left light".parse::<LightingPreset>().is_err());
    }

    #[test]
    fn test_preset_display_round_trips() {
        for preset in LightingPreset::ALL {
            assert_eq!(preset.to_string().parse::<LightingPreset>().unwrap(), preset);
        }
    }

    #[test]
    fn test_light_label_mapping() {
        assert_eq!(LightingPreset::from_light_label("Left"), LightingPreset::CustomLeft);
        assert_eq!(LightingPreset::from_light_label("Left_High"), LightingPreset::CustomLeftHigh);
        assert_eq!(LightingPreset::from_light_label("Right"), LightingPreset::CustomRight);
        assert_eq!(LightingPreset::from_light_label("Right_High"), LightingPreset::CustomRightHigh);
        assert_eq!(LightingPreset::from_light_label("Front"), LightingPreset::CustomGray);
        assert_eq!(LightingPreset::from_light_label(""), LightingPreset::CustomGray);
    }

    #[test]
    fn test_default_generation_params() {
        let params = GenerationParams::default();
        assert_eq!((params.width, params.height), (512, 640));
        assert_eq!(params.num_samples, 1);
        assert_eq!(params.seed, 12345);
        assert_eq!(params.steps, 25);
        assert!((params.cfg - 2.0).abs() < f64::EPSILON);
        assert!((params.highres_scale - 1.5).abs() < f64::EPSILON);
        assert!((params.highres_denoise - 0.5).abs() < f64::EPSILON);
        assert_eq!(params.added_prompt, "best quality");
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_builder_validation() {
        let config = RelightConfig::builder()
            .dimensions(768, 512)
            .steps(10)
            .seed(7)
            .build()
            .unwrap();
        assert_eq!(config.generation.width, 768);
        assert_eq!(config.generation.seed, 7);

        let err = RelightConfig::builder().dimensions(510, 640).build().unwrap_err();
        assert!(err.to_string().contains("image_width"));

        let err = RelightConfig::builder().highres(1.5, 0.0).build().unwrap_err();
        assert!(err.to_string().contains("highres_denoise"));

        assert!(RelightConfig::builder().num_samples(0).build().is_err());
        assert!(RelightConfig::builder().cfg(-1.0).build().is_err());
        assert!(RelightConfig::builder().normal_sharpness(f32::NAN).build().is_err());
    }

    #[test]
    fn test_execution_provider_parsing() {
        assert_eq!("CUDA".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::Cuda);
        assert_eq!("auto".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::Auto);
        assert!("coreml".parse::<ExecutionProvider>().is_err());
        assert_eq!(ExecutionProvider::Cpu.to_string(), "cpu");
    }

    #[test]
    fn test_config_serializes_presets_by_variant_name() {
        let json = serde_json::to_string(&LightingPreset::CustomLeftHigh).unwrap();
        assert_eq!(json, "\"CUSTOM_LEFT_HIGH\"");
        let config = RelightConfig::default();
        let round: RelightConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round, config);
    }
}
