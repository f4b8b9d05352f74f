//! Conversion of CLI arguments into library configuration

use crate::batch::{BatchConfig, PresetPolicy};
use crate::cli::main_impl::{Cli, CliMattingBackend, CliMode};
use crate::config::{BackendType, ExecutionProvider, LightingPreset, RelightConfig, RelightMode};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Convert CLI arguments to `RelightConfig` and `BatchConfig`
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the processor configuration
    pub(crate) fn from_cli(cli: &Cli) -> Result<RelightConfig> {
        let execution_provider: ExecutionProvider = cli
            .execution_provider
            .parse()
            .context("Invalid execution provider")?;

        let config = RelightConfig::builder()
            .dimensions(cli.image_width, cli.image_height)
            .num_samples(cli.num_samples)
            .seed(cli.seed)
            .steps(cli.steps)
            .cfg(cli.cfg)
            .highres(cli.highres_scale, cli.highres_denoise)
            .added_prompt(cli.a_prompt.clone())
            .negative_prompt(cli.n_prompt.clone())
            .execution_provider(execution_provider)
            .matting_backend(Self::matting_backend(cli.matting_backend))
            .mode(Self::mode(cli.mode))
            .normal_sharpness(cli.normal_sharpness)
            .normal_bias(cli.normal_bias)
            .build()?;

        Ok(config)
    }

    /// Build the batch driver configuration
    pub(crate) fn batch_config(cli: &Cli) -> Result<BatchConfig> {
        let input_dir = Self::required_path(cli.input_dir.as_ref(), "input_dir")?;
        let output_dir = Self::required_path(cli.output_dir.as_ref(), "output_dir")?;
        let light_labels = Self::required_path(cli.source_info_file.as_ref(), "source_info_file")?;
        let hair_labels = Self::required_path(cli.color_info_file.as_ref(), "color_info_file")?;
        let prompt = cli.prompt.clone().context("--prompt is required")?;

        if !input_dir.is_dir() {
            anyhow::bail!("Input directory does not exist: {}", input_dir.display());
        }
        if output_dir.is_file() {
            anyhow::bail!(
                "Output path exists and is a file, not a directory: {}",
                output_dir.display()
            );
        }

        let policy = Self::preset_policy(cli)?;
        if let PresetPolicy::Fixed(preset) = policy {
            if preset.needs_upload() && cli.bg_image.is_none() {
                anyhow::bail!("Preset '{}' requires --bg_image", preset.display_value());
            }
        }

        Ok(
            BatchConfig::new(input_dir, output_dir, prompt, light_labels, hair_labels)
                .with_preset_policy(policy)
                .with_mode(Self::mode(cli.mode))
                .with_background_image(cli.bg_image.clone())
                .with_save_all(cli.save_all),
        )
    }

    /// `--use_light_labels` wins, then `--bg_source`, then the gray default
    pub(crate) fn preset_policy(cli: &Cli) -> Result<PresetPolicy> {
        if cli.use_light_labels {
            return Ok(PresetPolicy::FromLabels);
        }
        match cli.bg_source.as_deref() {
            None | Some("None") => Ok(PresetPolicy::default()),
            Some(value) => {
                let preset: LightingPreset = value.parse().context("Invalid --bg_source")?;
                Ok(PresetPolicy::Fixed(preset))
            },
        }
    }

    fn required_path(value: Option<&PathBuf>, flag: &str) -> Result<PathBuf> {
        value
            .cloned()
            .with_context(|| format!("--{} is required", flag))
    }

    fn mode(mode: CliMode) -> RelightMode {
        match mode {
            CliMode::Relight => RelightMode::Relight,
            CliMode::Normal => RelightMode::Normal,
        }
    }

    fn matting_backend(backend: CliMattingBackend) -> BackendType {
        match backend {
            CliMattingBackend::Onnx => BackendType::Onnx,
            CliMattingBackend::Tract => BackendType::Tract,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn parse(extra: &[&str], input_dir: &str) -> Cli {
        let mut args = vec![
            "iclight-relight",
            "--input_dir",
            input_dir,
            "--output_dir",
            "out",
            "--prompt",
            "a portrait",
            "--source_info_file",
            "light.txt",
            "--color_info_file",
            "hair.txt",
        ];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_from_cli_maps_generation_parameters() {
        let cli = parse(
            &["--seed", "7", "--steps", "10", "--execution_provider", "cpu", "--matting_backend", "tract"],
            "in",
        );
        let config = CliConfigBuilder::from_cli(&cli).unwrap();
        assert_eq!(config.generation.seed, 7);
        assert_eq!(config.generation.steps, 10);
        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.matting_backend, BackendType::Tract);
        assert_eq!(config.mode, RelightMode::Relight);
    }

    #[test]
    fn test_from_cli_rejects_bad_values() {
        let cli = parse(&["--execution_provider", "tpu"], "in");
        assert!(CliConfigBuilder::from_cli(&cli).is_err());

        let cli = parse(&["--image_width", "100"], "in");
        assert!(CliConfigBuilder::from_cli(&cli).is_err());
    }

    #[test]
    fn test_preset_policy_resolution() {
        let cli = parse(&[], "in");
        assert_eq!(
            CliConfigBuilder::preset_policy(&cli).unwrap(),
            PresetPolicy::Fixed(LightingPreset::CustomGray)
        );

        let cli = parse(&["--bg_source", "Right Light"], "in");
        assert_eq!(
            CliConfigBuilder::preset_policy(&cli).unwrap(),
            PresetPolicy::Fixed(LightingPreset::Right)
        );

        let cli = parse(&["--use_light_labels"], "in");
        assert_eq!(CliConfigBuilder::preset_policy(&cli).unwrap(), PresetPolicy::FromLabels);

        let cli = parse(&["--bg_source", "Sideways"], "in");
        assert!(CliConfigBuilder::preset_policy(&cli).is_err());
    }

    #[test]
    fn test_batch_config_checks_directories_and_uploads() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().to_str().unwrap().to_string();

        let cli = parse(&["--mode", "normal", "--save_all"], &input);
        let batch = CliConfigBuilder::batch_config(&cli).unwrap();
        assert_eq!(batch.mode, RelightMode::Normal);
        assert!(batch.save_all);
        assert_eq!(batch.prompt, "a portrait");

        let cli = parse(&[], "/nonexistent/input/dir");
        assert!(CliConfigBuilder::batch_config(&cli).is_err());

        let cli = parse(&["--bg_source", "UPLOAD"], &input);
        assert!(CliConfigBuilder::batch_config(&cli).is_err());
    }
}
