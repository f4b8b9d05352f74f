//! Synthetic background generation for lighting presets

use crate::{
    config::LightingPreset,
    error::{RelightError, Result},
};
use image::{imageops, Rgb, RgbImage};
use tracing::debug;

/// Evenly spaced values over `[start, end]`, endpoints inclusive
///
/// A single sample yields `start`; zero samples yield an empty vector.
#[must_use]
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count)
                .map(|i| {
                    if i == count - 1 {
                        end
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        },
    }
}

/// Gradient direction of a linear ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Horizontal,
    Vertical,
}

/// One linear ramp running along an axis
#[derive(Debug, Clone, Copy)]
struct Ramp {
    axis: Axis,
    start: f64,
    end: f64,
}

impl Ramp {
    const fn horizontal(start: f64, end: f64) -> Self {
        Self {
            axis: Axis::Horizontal,
            start,
            end,
        }
    }

    const fn vertical(start: f64, end: f64) -> Self {
        Self {
            axis: Axis::Vertical,
            start,
            end,
        }
    }

    fn values(self, width: u32, height: u32) -> Vec<f64> {
        let count = match self.axis {
            Axis::Horizontal => width,
            Axis::Vertical => height,
        };
        linspace(self.start, self.end, count as usize)
    }
}

/// Background rule of a preset
enum Rule {
    Uniform(u8),
    Ramp(Ramp),
    Mean(Ramp, Ramp),
    Upload { flip: bool },
}

fn rule_for(preset: LightingPreset) -> Rule {
    match preset {
        LightingPreset::Upload => Rule::Upload { flip: false },
        LightingPreset::UploadFlip => Rule::Upload { flip: true },
        LightingPreset::Grey => Rule::Uniform(64),
        LightingPreset::CustomGray => Rule::Uniform(100),
        LightingPreset::Left => Rule::Ramp(Ramp::horizontal(224.0, 32.0)),
        LightingPreset::Right => Rule::Ramp(Ramp::horizontal(32.0, 224.0)),
        LightingPreset::Top => Rule::Ramp(Ramp::vertical(224.0, 32.0)),
        LightingPreset::Bottom => Rule::Ramp(Ramp::vertical(32.0, 224.0)),
        LightingPreset::CustomLeft => Rule::Mean(
            Ramp::horizontal(192.0, 64.0),
            Ramp::vertical(192.0, 64.0),
        ),
        LightingPreset::CustomLeftHigh => Rule::Mean(
            Ramp::horizontal(224.0, 32.0),
            Ramp::vertical(224.0, 32.0),
        ),
        LightingPreset::CustomRight => Rule::Mean(
            Ramp::horizontal(64.0, 192.0),
            Ramp::vertical(192.0, 64.0),
        ),
        LightingPreset::CustomRightHigh => Rule::Mean(
            Ramp::horizontal(32.0, 224.0),
            Ramp::vertical(224.0, 32.0),
        ),
    }
}

/// Truncating cast, matching an unsigned 8-bit conversion of non-negative floats
fn truncate_to_u8(value: f64) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

fn gray(value: u8) -> Rgb<u8> {
    Rgb([value, value, value])
}

/// Builds the conditioning background for a lighting preset
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundSynthesizer;

impl BackgroundSynthesizer {
    /// Synthesize the background for `preset` at `width` x `height`
    ///
    /// Upload presets return the uploaded image (mirrored for `UploadFlip`)
    /// at its own size; the generator resizes it afterwards.
    ///
    /// # Errors
    /// - Zero width or height
    /// - Upload preset without an uploaded background
    pub fn synthesize(
        preset: LightingPreset,
        upload: Option<&RgbImage>,
        width: u32,
        height: u32,
    ) -> Result<RgbImage> {
        if width == 0 || height == 0 {
            return Err(RelightError::invalid_config(format!(
                "Background dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }

        debug!(preset = %preset.variant_name(), width, height, "Synthesizing background");

        let image = match rule_for(preset) {
            Rule::Upload { flip } => {
                let upload = upload.ok_or_else(|| {
                    RelightError::invalid_config(format!(
                        "Preset '{}' requires an uploaded background image",
                        preset
                    ))
                })?;
                if flip {
                    imageops::flip_horizontal(upload)
                } else {
                    upload.clone()
                }
            },
            Rule::Uniform(value) => RgbImage::from_pixel(width, height, gray(value)),
            Rule::Ramp(ramp) => {
                let values: Vec<u8> = ramp
                    .values(width, height)
                    .into_iter()
                    .map(truncate_to_u8)
                    .collect();
                RgbImage::from_fn(width, height, |x, y| {
                    let index = match ramp.axis {
                        Axis::Horizontal => x,
                        Axis::Vertical => y,
                    };
                    gray(values[index as usize])
                })
            },
            Rule::Mean(first, second) => {
                let first_values = first.values(width, height);
                let second_values = second.values(width, height);
                let pick = |ramp: Ramp, values: &[f64], x: u32, y: u32| match ramp.axis {
                    Axis::Horizontal => values[x as usize],
                    Axis::Vertical => values[y as usize],
                };
                RgbImage::from_fn(width, height, |x, y| {
                    let a = pick(first, &first_values, x, y);
                    let b = pick(second, &second_values, x, y);
                    gray(truncate_to_u8((a + b) / 2.0))
                })
            },
        };

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        assert_eq!(linspace(224.0, 32.0, 4), vec![224.0, 160.0, 96.0, 32.0]);
        assert_eq!(linspace(5.0, 9.0, 1), vec![5.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_uniform_presets() {
        let grey = BackgroundSynthesizer::synthesize(LightingPreset::Grey, None, 3, 2).unwrap();
        assert!(grey.pixels().all(|p| p.0 == [64, 64, 64]));
        let gray = BackgroundSynthesizer::synthesize(LightingPreset::CustomGray, None, 3, 2).unwrap();
        assert!(gray.pixels().all(|p| p.0 == [100, 100, 100]));
    }

    #[test]
    fn test_left_gradient_row() {
        let bg = BackgroundSynthesizer::synthesize(LightingPreset::Left, None, 4, 2).unwrap();
        for y in 0..2 {
            let row: Vec<u8> = (0..4).map(|x| bg.get_pixel(x, y)[0]).collect();
            assert_eq!(row, vec![224, 160, 96, 32]);
        }
    }

    #[test]
    fn test_truncation_of_fractional_steps() {
        // linspace(224, 32, 6) = 224, 185.6, 147.2, 108.8, 70.4, 32
        let bg = BackgroundSynthesizer::synthesize(LightingPreset::Left, None, 6, 1).unwrap();
        let row: Vec<u8> = (0..6).map(|x| bg.get_pixel(x, 0)[0]).collect();
        assert_eq!(row, vec![224, 185, 147, 108, 70, 32]);
    }

    #[test]
    fn test_custom_left_mean() {
        let bg = BackgroundSynthesizer::synthesize(LightingPreset::CustomLeft, None, 3, 3).unwrap();
        // horizontal 192,128,64 and vertical 192,128,64
        assert_eq!(bg.get_pixel(0, 0)[0], 192);
        assert_eq!(bg.get_pixel(2, 0)[0], 128);
        assert_eq!(bg.get_pixel(2, 2)[0], 64);
        assert_eq!(bg.get_pixel(1, 2)[0], 96);
    }

    #[test]
    fn test_upload_presets() {
        let mut upload = RgbImage::new(2, 1);
        upload.put_pixel(0, 0, Rgb([10, 20, 30]));
        upload.put_pixel(1, 0, Rgb([40, 50, 60]));

        let same = BackgroundSynthesizer::synthesize(LightingPreset::Upload, Some(&upload), 8, 8).unwrap();
        assert_eq!(same, upload);

        let flipped =
            BackgroundSynthesizer::synthesize(LightingPreset::UploadFlip, Some(&upload), 8, 8).unwrap();
        assert_eq!(flipped.get_pixel(0, 0).0, [40, 50, 60]);
        assert_eq!(flipped.get_pixel(1, 0).0, [10, 20, 30]);

        let err = BackgroundSynthesizer::synthesize(LightingPreset::Upload, None, 8, 8).unwrap_err();
        assert!(matches!(err, RelightError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(BackgroundSynthesizer::synthesize(LightingPreset::Left, None, 0, 4).is_err());
        assert!(BackgroundSynthesizer::synthesize(LightingPreset::Grey, None, 4, 0).is_err());
    }
}
