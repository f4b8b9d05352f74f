//! Batch driver
//!
//! Pairs the PNG files of an input directory with per-image light-direction
//! and hair-color labels, relights each item in order and writes the results.

use crate::{
    config::{LightingPreset, RelightMode},
    error::{RelightError, Result},
    processor::RelightProcessor,
    services::{ImageIOService, ItemStage, NoOpProgressReporter, ProgressReporter, ProgressTracker},
    types::GenerationRequest,
};
use image::RgbImage;
use instant::{Duration, Instant};
use std::path::{Path, PathBuf};
use tracing::{info, span, Level};

/// Hair label that triggers the prompt augmentation
pub const GRAY_HAIR_LABEL: &str = "gray hair";

/// How the lighting preset of each item is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetPolicy {
    /// Same preset for every item
    Fixed(LightingPreset),
    /// Preset derived from the item's light-direction label
    FromLabels,
}

impl Default for PresetPolicy {
    fn default() -> Self {
        Self::Fixed(LightingPreset::CustomGray)
    }
}

impl PresetPolicy {
    #[must_use]
    pub fn resolve(&self, light_label: &str) -> LightingPreset {
        match self {
            Self::Fixed(preset) => *preset,
            Self::FromLabels => LightingPreset::from_light_label(light_label),
        }
    }
}

/// Prepend `"white hair "` when the hair label is exactly `"gray hair"`
#[must_use]
pub fn augment_prompt(prompt: &str, hair_label: &str) -> String {
    if hair_label == GRAY_HAIR_LABEL {
        format!("white hair {}", prompt)
    } else {
        prompt.to_string()
    }
}

/// Regular files with a lowercase `.png` extension, sorted by file name
///
/// # Errors
/// - Unreadable directory
pub fn find_png_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries =
        std::fs::read_dir(dir).map_err(|e| RelightError::file_io_error("read input directory", dir, &e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RelightError::file_io_error("read input directory", dir, &e))?;
        let path = entry.path();
        if path.is_file() && ImageIOService::is_png_path(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// One trimmed label per line
///
/// # Errors
/// - Unreadable file
pub fn read_labels<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).map_err(|e| RelightError::file_io_error("read label file", path, &e))?;
    Ok(content.lines().map(|line| line.trim().to_string()).collect())
}

/// One unit of batch work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub image_path: PathBuf,
    pub light_label: String,
    pub hair_label: String,
}

impl BatchItem {
    /// Output file name (the input file name)
    #[must_use]
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.image_path.file_name()
    }
}

/// Pair images with labels by position, stopping at the shortest sequence
#[must_use]
pub fn pair_items(images: Vec<PathBuf>, light_labels: Vec<String>, hair_labels: Vec<String>) -> Vec<BatchItem> {
    images
        .into_iter()
        .zip(light_labels)
        .zip(hair_labels)
        .map(|((image_path, light_label), hair_label)| BatchItem {
            image_path,
            light_label,
            hair_label,
        })
        .collect()
}

/// Configuration of a batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub prompt: String,
    pub light_labels_file: PathBuf,
    pub hair_labels_file: PathBuf,
    pub preset_policy: PresetPolicy,
    pub mode: RelightMode,
    /// Background for the upload presets
    pub background_image: Option<PathBuf>,
    /// Write every output of an item, not only the first
    pub save_all: bool,
}

impl BatchConfig {
    #[must_use]
    pub fn new<P: Into<PathBuf>, S: Into<String>>(
        input_dir: P,
        output_dir: P,
        prompt: S,
        light_labels_file: P,
        hair_labels_file: P,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            prompt: prompt.into(),
            light_labels_file: light_labels_file.into(),
            hair_labels_file: hair_labels_file.into(),
            preset_policy: PresetPolicy::default(),
            mode: RelightMode::Relight,
            background_image: None,
            save_all: false,
        }
    }

    #[must_use]
    pub fn with_preset_policy(mut self, policy: PresetPolicy) -> Self {
        self.preset_policy = policy;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RelightMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_background_image<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.background_image = path.map(Into::into);
        self
    }

    #[must_use]
    pub fn with_save_all(mut self, save_all: bool) -> Self {
        self.save_all = save_all;
        self
    }

    /// Collect and pair the batch items
    ///
    /// # Errors
    /// - Unreadable input directory or label files
    pub fn collect_items(&self) -> Result<Vec<BatchItem>> {
        let images = find_png_files(&self.input_dir)?;
        let light_labels = read_labels(&self.light_labels_file)?;
        let hair_labels = read_labels(&self.hair_labels_file)?;
        if images.len() != light_labels.len() || images.len() != hair_labels.len() {
            log::warn!(
                "Input counts differ ({} images, {} light labels, {} hair labels); extra entries are ignored",
                images.len(),
                light_labels.len(),
                hair_labels.len()
            );
        }
        Ok(pair_items(images, light_labels, hair_labels))
    }
}

/// Result of a completed batch
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// Number of items processed
    pub processed: usize,
    /// Files written, in order
    pub written: Vec<PathBuf>,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// Sequential batch driver over a loaded processor
pub struct BatchDriver<'a> {
    processor: &'a mut RelightProcessor,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> BatchDriver<'a> {
    pub fn new(processor: &'a mut RelightProcessor) -> Self {
        Self {
            processor,
            reporter: &NoOpProgressReporter,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: &'a dyn ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run the batch; the first error aborts the run
    ///
    /// # Errors
    /// - Unreadable inputs, label files or background image
    /// - Output directory creation or write failures
    /// - Any relighting failure
    pub fn run(&mut self, config: &BatchConfig) -> Result<BatchSummary> {
        let start = Instant::now();
        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| RelightError::file_io_error("create output directory", &config.output_dir, &e))?;

        let background = config
            .background_image
            .as_ref()
            .map(ImageIOService::load_rgb_image)
            .transpose()?;

        let items = config.collect_items()?;
        info!(items = items.len(), mode = ?config.mode, "Starting batch");

        let mut tracker = ProgressTracker::new(self.reporter, items.len());
        let mut summary = BatchSummary::default();
        for (index, item) in items.iter().enumerate() {
            let _span = span!(
                Level::INFO,
                "batch_item",
                index,
                image = %item.image_path.display(),
                light = %item.light_label,
                hair = %item.hair_label
            )
            .entered();

            tracker.report_stage(&item.image_path, ItemStage::Loading);
            let image = ImageIOService::load_rgb_image(&item.image_path)?;

            tracker.report_stage(&item.image_path, ItemStage::Relighting);
            let outputs = self.process_item(config, item, image, background.as_ref())?;

            tracker.report_stage(&item.image_path, ItemStage::Saving);
            summary.written.extend(save_outputs(config, item, &outputs)?);
            summary.processed += 1;
            tracker.complete_item(&item.image_path);
        }
        tracker.finish();

        summary.elapsed = start.elapsed();
        info!(
            processed = summary.processed,
            elapsed_s = summary.elapsed.as_secs_f64(),
            "Batch complete"
        );
        Ok(summary)
    }

    fn process_item(
        &mut self,
        config: &BatchConfig,
        item: &BatchItem,
        image: RgbImage,
        background: Option<&RgbImage>,
    ) -> Result<Vec<RgbImage>> {
        let preset = config.preset_policy.resolve(&item.light_label);
        let request = GenerationRequest::builder(image)
            .prompt(augment_prompt(&config.prompt, &item.hair_label))
            .preset(preset)
            .uploaded_background(background.cloned())
            .params(self.processor.config().generation.clone())
            .build()?;

        match config.mode {
            RelightMode::Relight => self.processor.relight(&request),
            RelightMode::Normal => self.processor.estimate_normals(&request),
        }
    }
}

fn save_outputs(config: &BatchConfig, item: &BatchItem, outputs: &[RgbImage]) -> Result<Vec<PathBuf>> {
    let file_name = item.file_name().ok_or_else(|| {
        RelightError::internal(format!("Input path has no file name: {}", item.image_path.display()))
    })?;
    let first = outputs
        .first()
        .ok_or_else(|| RelightError::processing("Relighting produced no outputs"))?;

    let mut written = Vec::new();
    let primary = config.output_dir.join(file_name);
    ImageIOService::save_png(first, &primary)?;
    written.push(primary);

    if config.save_all {
        let stem = item
            .image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        for (index, output) in outputs.iter().enumerate().skip(1) {
            let path = config.output_dir.join(format!("{}_{}.png", stem, index));
            ImageIOService::save_png(output, &path)?;
            written.push(path);
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_augment_prompt() {
        assert_eq!(augment_prompt("portrait", "gray hair"), "white hair portrait");
        assert_eq!(augment_prompt("portrait", "black hair"), "portrait");
        assert_eq!(augment_prompt("portrait", "Gray hair"), "portrait");
    }

    #[test]
    fn test_preset_policy() {
        assert_eq!(PresetPolicy::default().resolve("Left"), LightingPreset::CustomGray);
        assert_eq!(PresetPolicy::FromLabels.resolve("Left"), LightingPreset::CustomLeft);
        assert_eq!(PresetPolicy::FromLabels.resolve("Top"), LightingPreset::CustomGray);
        assert_eq!(
            PresetPolicy::Fixed(LightingPreset::Right).resolve("Left"),
            LightingPreset::Right
        );
    }

    #[test]
    fn test_find_png_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.png", "a.png", "c.PNG", "d.jpg", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.png")).unwrap();

        let files = find_png_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_read_labels_trims_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("light.txt");
        fs::write(&path, "Left \n  Right_High\r\nFront\n").unwrap();
        assert_eq!(read_labels(&path).unwrap(), vec!["Left", "Right_High", "Front"]);
        assert!(read_labels(dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_pair_items_stops_at_shortest() {
        let images = vec![PathBuf::from("a.png"), PathBuf::from("b.png"), PathBuf::from("c.png")];
        let lights = vec!["Left".to_string(), "Right".to_string()];
        let hairs = vec!["gray hair".to_string(), "black hair".to_string(), "red hair".to_string()];
        let items = pair_items(images, lights, hairs);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].image_path, PathBuf::from("b.png"));
        assert_eq!(items[1].light_label, "Right");
        assert_eq!(items[1].hair_label, "black hair");
    }
}
