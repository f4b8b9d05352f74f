//! Foreground extraction over a matting backend

use crate::{
    error::{RelightError, Result},
    inference::InferenceBackend,
    types::AlphaMatte,
    utils::ImagePreprocessor,
};
use image::{Rgb, RgbImage};
use instant::Instant;
use ndarray::{Array2, ArrayView2};
use tracing::{debug, instrument};

/// Strips the background from a portrait with a matting network
pub struct ForegroundExtractor<'a> {
    backend: &'a mut dyn InferenceBackend,
}

impl<'a> ForegroundExtractor<'a> {
    #[must_use]
    pub fn new(backend: &'a mut dyn InferenceBackend) -> Self {
        Self { backend }
    }

    /// Predict the matte and composite the foreground over mid gray
    ///
    /// Returns `127 + (image - 127 + sigma) * alpha` (clipped, truncated)
    /// together with the matte at the input resolution.
    ///
    /// # Errors
    /// - Backend not initialized or inference failure
    /// - Matte output that is not (1, 1, h, w)
    #[instrument(skip(self, image), fields(backend = self.backend.name(), width = image.width(), height = image.height()))]
    pub fn remove_background(&mut self, image: &RgbImage, sigma: f32) -> Result<(RgbImage, AlphaMatte)> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(RelightError::invalid_config("Cannot extract foreground of an empty image"));
        }
        if !self.backend.is_initialized() {
            return Err(RelightError::internal("Matting backend not initialized"));
        }

        let start = Instant::now();
        let (feed_width, feed_height) = ImagePreprocessor::matting_input_dimensions(width, height);
        let feed = ImagePreprocessor::resize_without_crop(image, feed_width, feed_height);
        let input = ImagePreprocessor::images_to_tensor(&[feed])?;

        let output = self.backend.infer(&input)?;
        let (batch, channels, matte_height, matte_width) = output.dim();
        if batch != 1 || channels != 1 || matte_height == 0 || matte_width == 0 {
            return Err(RelightError::processing_stage_error(
                "matting",
                &format!("unexpected matte shape {:?}", output.dim()),
                Some(&format!("{}x{}", feed_width, feed_height)),
            ));
        }

        let matte = output.index_axis(ndarray::Axis(0), 0);
        let matte = matte.index_axis(ndarray::Axis(0), 0);
        let alpha = AlphaMatte::new(bilinear_resize(matte, width as usize, height as usize));
        let composited = composite(image, &alpha, sigma);

        debug!(
            feed = %format!("{}x{}", feed_width, feed_height),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Foreground extracted"
        );
        Ok((composited, alpha))
    }
}

/// Composite over mid gray: `127 + (image - 127 + sigma) * alpha`, clipped and truncated
#[must_use]
pub fn composite(image: &RgbImage, alpha: &AlphaMatte, sigma: f32) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let a = alpha.get(x, y).unwrap_or(0.0);
        let source = image.get_pixel(x, y);
        let blend = |c: u8| (127.0 + (f32::from(c) - 127.0 + sigma) * a).clamp(0.0, 255.0) as u8;
        Rgb([blend(source[0]), blend(source[1]), blend(source[2])])
    })
}

/// Bilinear resize with half-pixel centres (`align_corners = false`)
#[must_use]
pub fn bilinear_resize(source: ArrayView2<'_, f32>, width: usize, height: usize) -> Array2<f32> {
    let (source_height, source_width) = source.dim();
    let scale_y = source_height as f32 / height as f32;
    let scale_x = source_width as f32 / width as f32;

    let sample_axis = |dst: usize, scale: f32, len: usize| {
        let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let low = (pos.floor() as usize).min(len - 1);
        let high = (low + 1).min(len - 1);
        let frac = pos - low as f32;
        (low, high, frac)
    };

    let rows: Vec<_> = (0..height).map(|y| sample_axis(y, scale_y, source_height)).collect();
    let cols: Vec<_> = (0..width).map(|x| sample_axis(x, scale_x, source_width)).collect();

    #[allow(clippy::indexing_slicing)]
    // Safe: sample indices are clamped to the source bounds
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = source[[y0, x0]] * (1.0 - fx) + source[[y0, x1]] * fx;
        let bottom = source[[y1, x0]] * (1.0 - fx) + source[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockMattingBackend;
    use crate::config::RelightConfig;
    use ndarray::array;

    #[test]
    fn test_bilinear_upsample_matches_half_pixel_rule() {
        let source = array![[0.0_f32, 1.0]];
        let resized = bilinear_resize(source.view(), 4, 1);
        // positions: -0.25 -> 0, 0.25, 0.75, 1.25 -> clamped
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (got, want) in resized.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_bilinear_identity() {
        let source = array![[0.1_f32, 0.2], [0.3, 0.4]];
        let resized = bilinear_resize(source.view(), 2, 2);
        assert_eq!(resized, source);
    }

    #[test]
    fn test_composite_rule() {
        let image = RgbImage::from_pixel(1, 1, Rgb([200, 100, 0]));
        let full = composite(&image, &AlphaMatte::filled(1, 1, 1.0), 0.0);
        assert_eq!(full.get_pixel(0, 0).0, [200, 100, 0]);

        let none = composite(&image, &AlphaMatte::filled(1, 1, 0.0), 16.0);
        assert_eq!(none.get_pixel(0, 0).0, [127, 127, 127]);

        let biased = composite(&image, &AlphaMatte::filled(1, 1, 1.0), 16.0);
        assert_eq!(biased.get_pixel(0, 0).0, [216, 116, 16]);

        let half = composite(&image, &AlphaMatte::filled(1, 1, 0.5), 0.0);
        assert_eq!(half.get_pixel(0, 0).0, [163, 113, 63]);
    }

    #[test]
    fn test_remove_background_with_mock() {
        let mut backend = MockMattingBackend::constant(1.0);
        backend.initialize(&RelightConfig::default()).unwrap();
        let image = RgbImage::from_pixel(32, 48, Rgb([10, 200, 90]));

        let mut extractor = ForegroundExtractor::new(&mut backend);
        let (composited, matte) = extractor.remove_background(&image, 0.0).unwrap();
        assert_eq!(composited, image);
        assert_eq!((matte.width(), matte.height()), (32, 48));

        let calls = backend.get_call_history();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "initialize");
        assert!(calls[1].starts_with("infer 1x3x"));
    }

    #[test]
    fn test_remove_background_requires_initialization() {
        let mut backend = MockMattingBackend::constant(1.0);
        let image = RgbImage::new(8, 8);
        let err = ForegroundExtractor::new(&mut backend)
            .remove_background(&image, 0.0)
            .unwrap_err();
        assert!(matches!(err, RelightError::Internal(_)));
    }

    #[test]
    fn test_remove_background_propagates_backend_failure() {
        let mut backend = MockMattingBackend::new_failing_inference();
        backend.initialize(&RelightConfig::default()).unwrap();
        let image = RgbImage::new(8, 8);
        let err = ForegroundExtractor::new(&mut backend)
            .remove_background(&image, 0.0)
            .unwrap_err();
        assert!(matches!(err, RelightError::Inference(_)));
    }
}
