//! Service layer for file access and progress reporting

pub mod io;
pub mod progress;

pub use io::ImageIOService;
pub use progress::{
    BatchProgressUpdate, ItemStage, NoOpProgressReporter, ProgressReporter, ProgressTracker,
};
