//! Pseudo normal-map estimation from four directional relighting passes

use crate::{
    config::NORMAL_SHARPNESS,
    error::{RelightError, Result},
    types::{AlphaMatte, FloatImage},
};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Zip};
use tracing::debug;

const EPSILON: f32 = 1e-5;

/// `((a + e) / (b + e)) - 1` with `e = 1e-5`
#[must_use]
pub fn safe_divide(a: f32, b: f32) -> f32 {
    ((a + EPSILON) / (b + EPSILON)) - 1.0
}

/// The four relit passes, each (height, width, 3) in [0, 1]
#[derive(Debug, Clone, Copy)]
pub struct DirectionalPasses<'a> {
    pub left: &'a FloatImage,
    pub right: &'a FloatImage,
    pub bottom: &'a FloatImage,
    pub top: &'a FloatImage,
}

impl DirectionalPasses<'_> {
    fn check_shapes(&self) -> Result<(usize, usize)> {
        let shape = self.left.dim();
        if shape.2 != 3 {
            return Err(RelightError::processing(format!(
                "Normal estimation expects 3 channels, got {}",
                shape.2
            )));
        }
        for (name, pass) in [("right", self.right), ("bottom", self.bottom), ("top", self.top)] {
            if pass.dim() != shape {
                return Err(RelightError::processing_stage_error(
                    "normal_estimation",
                    &format!("{} pass has shape {:?}, expected {:?}", name, pass.dim(), shape),
                    None,
                ));
            }
        }
        Ok((shape.0, shape.1))
    }
}

/// Derives a normal map from directional lighting ratios
#[derive(Debug, Clone, Copy)]
pub struct NormalMapEstimator {
    sharpness: f32,
}

impl Default for NormalMapEstimator {
    fn default() -> Self {
        Self {
            sharpness: NORMAL_SHARPNESS,
        }
    }
}

impl NormalMapEstimator {
    #[must_use]
    pub fn new(sharpness: f32) -> Self {
        Self { sharpness }
    }

    #[must_use]
    pub fn sharpness(&self) -> f32 {
        self.sharpness
    }

    /// Estimate the normal map and its diagnostics
    ///
    /// Output order: normal, left/right/bottom/top ratios, then the four passes
    /// rescaled to [-1, 1]. Every output is mapped `x * 127.5 + 127.5`.
    ///
    /// # Errors
    /// - Passes of differing shapes
    /// - Matte resizing failures
    pub fn estimate(&self, passes: DirectionalPasses<'_>, matte: &AlphaMatte) -> Result<Vec<RgbImage>> {
        let (height, width) = passes.check_shapes()?;
        debug!(width, height, sharpness = self.sharpness, "Estimating normal map");

        // always quantized, even at matching size
        let alpha = matte.resized_for_output(width as u32, height as u32)?;

        let ambient = (passes.left + passes.right + passes.bottom + passes.top) / 4.0;
        let ratio = |pass: &FloatImage| {
            let mut out = pass.clone();
            Zip::from(&mut out).and(&ambient).for_each(|v, &a| *v = safe_divide(*v, a));
            out
        };
        let left = ratio(passes.left);
        let right = ratio(passes.right);
        let bottom = ratio(passes.bottom);
        let top = ratio(passes.top);

        let exponent = 0.5 * self.sharpness;
        let mut normal = Array3::<f32>::zeros((height, width, 3));
        for y in 0..height {
            for x in 0..width {
                let mut u = 0.0;
                let mut v = 0.0;
                for c in 0..3 {
                    u += (right[[y, x, c]] - left[[y, x, c]]) * 0.5;
                    v += (top[[y, x, c]] - bottom[[y, x, c]]) * 0.5;
                }
                u /= 3.0;
                v /= 3.0;
                let h = (1.0 - u * u - v * v).clamp(0.0, 1e5).powf(exponent);
                let norm = (u * u + v * v + h * h).sqrt();
                let a = alpha.get(x as u32, y as u32).unwrap_or(0.0);
                let blended = [u / norm * a, v / norm * a, h / norm * a + (1.0 - a)];
                for (c, value) in blended.into_iter().enumerate() {
                    normal[[y, x, c]] = value;
                }
            }
        }

        let raw = |pass: &FloatImage| pass.mapv(|v| v * 2.0 - 1.0);
        let outputs = [
            normal,
            left,
            right,
            bottom,
            top,
            raw(passes.left),
            raw(passes.right),
            raw(passes.bottom),
            raw(passes.top),
        ];
        Ok(outputs.iter().map(signed_to_rgb).collect())
    }
}

/// Map [-1, 1] values to 8-bit (`x * 127.5 + 127.5`, clipped, truncated)
#[must_use]
pub fn signed_to_rgb(image: &Array3<f32>) -> RgbImage {
    let (height, width, _) = image.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let value = |c: usize| {
            let v = image[[y as usize, x as usize, c]] * 127.5 + 127.5;
            // NaN maps to 0 like an unsigned cast
            if v.is_nan() {
                0
            } else {
                v.clamp(0.0, 255.0) as u8
            }
        };
        Rgb([value(0), value(1), value(2)])
    })
}
