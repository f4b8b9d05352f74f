//! Shared image preprocessing utilities
//!
//! Resizing rules and the pixel/tensor conversions used on both sides of the
//! diffusion and matting backends.

use crate::{
    error::{RelightError, Result},
    types::FloatImage,
};
use image::{imageops, imageops::FilterType, ImageBuffer, Pixel, Rgb, RgbImage};
use ndarray::{Array3, Array4};

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Scale to cover `target_width` x `target_height`, then crop the center
    ///
    /// The scale factor is the larger of the two axis ratios, resized sizes and
    /// the crop box are rounded half-to-even, resampling uses Lanczos.
    #[must_use]
    pub fn resize_and_center_crop(image: &RgbImage, target_width: u32, target_height: u32) -> RgbImage {
        Self::resize_and_center_crop_with(image, target_width, target_height, FilterType::Lanczos3)
    }

    /// `resize_and_center_crop` over any 8-bit pixel type with an explicit filter
    #[must_use]
    pub fn resize_and_center_crop_with<P>(
        image: &ImageBuffer<P, Vec<u8>>,
        target_width: u32,
        target_height: u32,
        filter: FilterType,
    ) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let (original_width, original_height) = image.dimensions();
        let scale = (f64::from(target_width) / f64::from(original_width))
            .max(f64::from(target_height) / f64::from(original_height));
        let resized_width = ((f64::from(original_width) * scale).round_ties_even() as u32).max(target_width);
        let resized_height =
            ((f64::from(original_height) * scale).round_ties_even() as u32).max(target_height);

        let resized = if (resized_width, resized_height) == (original_width, original_height) {
            image.clone()
        } else {
            imageops::resize(image, resized_width, resized_height, filter)
        };

        let left = crop_origin(resized_width, target_width);
        let top = crop_origin(resized_height, target_height);
        imageops::crop_imm(&resized, left, top, target_width, target_height).to_image()
    }

    /// Plain Lanczos resize to the exact target size
    #[must_use]
    pub fn resize_without_crop(image: &RgbImage, target_width: u32, target_height: u32) -> RgbImage {
        if image.dimensions() == (target_width, target_height) {
            return image.clone();
        }
        imageops::resize(image, target_width, target_height, FilterType::Lanczos3)
    }

    /// Stack images into an NCHW tensor scaled as `x / 127 - 1`
    ///
    /// # Errors
    /// - Empty input
    /// - Images of differing sizes
    pub fn images_to_tensor(images: &[RgbImage]) -> Result<Array4<f32>> {
        let first = images
            .first()
            .ok_or_else(|| RelightError::processing("Cannot build a tensor from zero images"))?;
        let (width, height) = first.dimensions();
        if let Some(other) = images.iter().find(|img| img.dimensions() != (width, height)) {
            return Err(RelightError::processing(format!(
                "Image size mismatch: expected {}x{}, got {}x{}",
                width,
                height,
                other.width(),
                other.height()
            )));
        }

        let mut tensor = Array4::<f32>::zeros((images.len(), 3, height as usize, width as usize));
        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match every image
        for (n, img) in images.iter().enumerate() {
            for (x, y, pixel) in img.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[n, c, y as usize, x as usize]] = f32::from(pixel[c]) / 127.0 - 1.0;
                }
            }
        }
        Ok(tensor)
    }

    /// Convert an NCHW tensor in [-1, 1] to 8-bit images (`y * 127.5 + 127.5`, clipped, truncated)
    ///
    /// # Errors
    /// - Tensor without exactly three channels
    pub fn tensor_to_images(tensor: &Array4<f32>) -> Result<Vec<RgbImage>> {
        let (batch, channels, height, width) = tensor.dim();
        Self::check_channels(channels)?;
        Ok((0..batch)
            .map(|n| {
                RgbImage::from_fn(width as u32, height as u32, |x, y| {
                    let value = |c: usize| {
                        (tensor[[n, c, y as usize, x as usize]] * 127.5 + 127.5).clamp(0.0, 255.0) as u8
                    };
                    Rgb([value(0), value(1), value(2)])
                })
            })
            .collect())
    }

    /// Convert an NCHW tensor in [-1, 1] to float images (`y * 0.5 + 0.5`, clipped to [0, 1])
    ///
    /// # Errors
    /// - Tensor without exactly three channels
    pub fn tensor_to_float_images(tensor: &Array4<f32>) -> Result<Vec<FloatImage>> {
        let (batch, channels, height, width) = tensor.dim();
        Self::check_channels(channels)?;
        Ok((0..batch)
            .map(|n| {
                Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
                    (tensor[[n, c, y, x]] * 0.5 + 0.5).clamp(0.0, 1.0)
                })
            })
            .collect())
    }

    /// Quantize a float image in [0, 1] (`x * 255`, clipped, truncated)
    #[must_use]
    pub fn float_to_rgb(image: &FloatImage) -> RgbImage {
        let (height, width, _) = image.dim();
        RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let value = |c: usize| (image[[y as usize, x as usize, c]] * 255.0).clamp(0.0, 255.0) as u8;
            Rgb([value(0), value(1), value(2)])
        })
    }

    /// Highres pass size: each side scaled and rounded to a multiple of 64
    #[must_use]
    pub fn highres_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
        let side = |v: u32| {
            let blocks = (f64::from(v) * scale / 64.0).round_ties_even().max(1.0);
            blocks as u32 * 64
        };
        (side(width), side(height))
    }

    /// Matting feed size, keeping roughly 256x256 worth of 64-pixel blocks
    #[must_use]
    pub fn matting_input_dimensions(width: u32, height: u32) -> (u32, u32) {
        let k = (256.0 / (f64::from(width) * f64::from(height))).sqrt();
        let side = |v: u32| {
            let blocks = (f64::from(v) * k).round_ties_even().max(1.0);
            blocks as u32 * 64
        };
        (side(width), side(height))
    }

    fn check_channels(channels: usize) -> Result<()> {
        if channels == 3 {
            Ok(())
        } else {
            Err(RelightError::processing(format!(
                "Expected 3 image channels, got {}",
                channels
            )))
        }
    }
}

/// Left/top of a centered crop box, rounded half-to-even
fn crop_origin(resized: u32, target: u32) -> u32 {
    let origin = (f64::from(resized) - f64::from(target)) / 2.0;
    (origin.round_ties_even() as u32).min(resized.saturating_sub(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn test_resize_and_center_crop_dimensions() {
        let image = RgbImage::from_pixel(100, 50, Rgb([10, 20, 30]));
        let cropped = ImagePreprocessor::resize_and_center_crop(&image, 40, 40);
        assert_eq!(cropped.dimensions(), (40, 40));

        let same = ImagePreprocessor::resize_and_center_crop(&image, 100, 50);
        assert_eq!(same, image);
    }

    #[test]
    fn test_center_crop_takes_middle() {
        // 4 columns: 0, 1, 2, 3 -> crop width 2 from the middle keeps 1, 2
        let image = RgbImage::from_fn(4, 2, |x, _| Rgb([x as u8, 0, 0]));
        let cropped = ImagePreprocessor::resize_and_center_crop(&image, 2, 2);
        assert_eq!(cropped.get_pixel(0, 0)[0], 1);
        assert_eq!(cropped.get_pixel(1, 0)[0], 2);
    }

    #[test]
    fn test_crop_origin_rounds_half_to_even() {
        assert_eq!(crop_origin(513, 512), 0);
        assert_eq!(crop_origin(515, 512), 2);
        assert_eq!(crop_origin(512, 512), 0);
    }

    #[test]
    fn test_gray_crop() {
        let image = GrayImage::from_pixel(30, 60, image::Luma([200]));
        let cropped =
            ImagePreprocessor::resize_and_center_crop_with(&image, 20, 20, FilterType::Lanczos3);
        assert_eq!(cropped.dimensions(), (20, 20));
        assert!(cropped.pixels().all(|p| p[0] == 200));
    }

    #[test]
    fn test_tensor_scaling() {
        let image = RgbImage::from_pixel(2, 2, Rgb([127, 0, 254]));
        let tensor = ImagePreprocessor::images_to_tensor(&[image]).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 2, 2));
        assert!(tensor[[0, 0, 0, 0]].abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 1]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_rejects_mismatched_sizes() {
        let err = ImagePreprocessor::images_to_tensor(&[RgbImage::new(2, 2), RgbImage::new(3, 2)]);
        assert!(err.is_err());
        assert!(ImagePreprocessor::images_to_tensor(&[]).is_err());
    }

    #[test]
    fn test_quantized_and_float_outputs() {
        let mut tensor = Array4::<f32>::zeros((1, 3, 1, 2));
        tensor[[0, 0, 0, 0]] = 1.0;
        tensor[[0, 1, 0, 0]] = -1.5;
        tensor[[0, 2, 0, 1]] = 0.5;

        let images = ImagePreprocessor::tensor_to_images(&tensor).unwrap();
        assert_eq!(images[0].get_pixel(0, 0).0, [255, 0, 127]);
        assert_eq!(images[0].get_pixel(1, 0)[2], 191);

        let floats = ImagePreprocessor::tensor_to_float_images(&tensor).unwrap();
        assert!((floats[0][[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(floats[0][[0, 0, 1]].abs() < 1e-6);
        assert!((floats[0][[0, 1, 2]] - 0.75).abs() < 1e-6);

        let bad = Array4::<f32>::zeros((1, 4, 1, 1));
        assert!(ImagePreprocessor::tensor_to_images(&bad).is_err());
    }

    #[test]
    fn test_float_to_rgb_truncates() {
        let image = Array3::from_elem((1, 1, 3), 0.999_f32);
        assert_eq!(ImagePreprocessor::float_to_rgb(&image).get_pixel(0, 0).0, [254, 254, 254]);
    }

    #[test]
    fn test_highres_dimensions() {
        assert_eq!(ImagePreprocessor::highres_dimensions(512, 640, 1.5), (768, 960));
        assert_eq!(ImagePreprocessor::highres_dimensions(512, 512, 1.0), (512, 512));
    }

    #[test]
    fn test_matting_input_dimensions() {
        assert_eq!(ImagePreprocessor::matting_input_dimensions(512, 512), (1024, 1024));
        assert_eq!(ImagePreprocessor::matting_input_dimensions(1, 1), (1024, 1024));
        let (w, h) = ImagePreprocessor::matting_input_dimensions(512, 640);
        assert_eq!((w % 64, h % 64), (0, 0));
        assert!(h > w);
    }
}
