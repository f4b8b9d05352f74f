//! Backend implementations for the inference seams
//!
//! - ONNX Runtime and Tract run the matting network
//! - Candle runs the IC-Light conditioned Stable Diffusion model
//! - Mock backends drive the pipeline in tests without model weights

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(feature = "candle")]
pub mod candle;

pub mod mock;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;

#[cfg(feature = "candle")]
pub use self::candle::CandleDiffusionBackend;

pub use self::mock::{MockDiffusionBackend, MockMattingBackend};
