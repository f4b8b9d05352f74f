//! Image I/O operations service
//!
//! Keeps file access out of the relighting logic.

use crate::error::{RelightError, Result};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::path::Path;

/// Service for handling image file input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Load a 3-channel 8-bit RGB image
    ///
    /// Images with an alpha channel, grayscale images and 16-bit images are
    /// rejected rather than converted.
    ///
    /// # Errors
    /// - Missing or unreadable file
    /// - Decoding failures
    /// - Non-RGB pixel layout
    pub fn load_rgb_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Err(RelightError::file_io_error(
                "read image file",
                path_ref,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        let image = image::open(path_ref)?;
        match image {
            DynamicImage::ImageRgb8(rgb) => Ok(rgb),
            other => Err(RelightError::unsupported_format(format!(
                "'{}' has pixel layout {:?}, expected 8-bit RGB",
                path_ref.display(),
                other.color()
            ))),
        }
    }

    /// Save an image as PNG
    ///
    /// # Errors
    /// - Encoding or write failures
    pub fn save_png<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        image
            .save_with_format(path_ref, ImageFormat::Png)
            .map_err(|e| match e {
                image::ImageError::IoError(io_err) => {
                    RelightError::file_io_error("write image file", path_ref, &io_err)
                },
                other => RelightError::Image(other),
            })?;
        log::debug!("Saved {}", path_ref.display());
        Ok(())
    }

    /// Whether the path has the exact lowercase `png` extension
    #[must_use]
    pub fn is_png_path<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().extension().and_then(|ext| ext.to_str()) == Some("png")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_rgb_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portrait.png");
        let image = RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]));
        ImageIOService::save_png(&image, &path).unwrap();
        assert_eq!(ImageIOService::load_rgb_image(&path).unwrap(), image);
    }

    #[test]
    fn test_rejects_rgba_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alpha.png");
        RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4])).save(&path).unwrap();
        let err = ImageIOService::load_rgb_image(&path).unwrap_err();
        assert!(matches!(err, RelightError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ImageIOService::load_rgb_image("/nonexistent/portrait.png").unwrap_err();
        assert!(matches!(err, RelightError::Io(_)));
        assert!(err.to_string().contains("portrait.png"));
    }

    #[test]
    fn test_png_extension_is_exact() {
        assert!(ImageIOService::is_png_path("a/b.png"));
        assert!(!ImageIOService::is_png_path("a/b.PNG"));
        assert!(!ImageIOService::is_png_path("a/b.jpg"));
        assert!(!ImageIOService::is_png_path("a/png"));
    }
}
