//! Progress reporting for batch runs

use instant::Instant;
use std::path::{Path, PathBuf};

/// Stage of a single batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    /// Reading the portrait from disk
    Loading,
    /// Foreground extraction and diffusion passes
    Relighting,
    /// Writing outputs
    Saving,
}

impl ItemStage {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Loading => "Loading image",
            Self::Relighting => "Relighting",
            Self::Saving => "Saving outputs",
        }
    }
}

/// Progress of a batch after an event
#[derive(Debug, Clone)]
pub struct BatchProgressUpdate {
    /// Number of items completed
    pub items_completed: usize,
    /// Total number of items to process
    pub items_total: usize,
    /// Item the event refers to
    pub current_item: PathBuf,
    /// Stage of the current item
    pub stage: ItemStage,
    /// Seconds since the batch started
    pub elapsed_seconds: f64,
}

impl BatchProgressUpdate {
    /// Estimated seconds remaining, from the average time per completed item
    #[must_use]
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.items_completed == 0 {
            return None;
        }
        let per_item = self.elapsed_seconds / self.items_completed as f64;
        let remaining = self.items_total.saturating_sub(self.items_completed);
        Some((per_item * remaining as f64).round() as u64)
    }
}

/// Trait for reporting progress during a batch run
pub trait ProgressReporter {
    /// Called once before the first item
    fn report_start(&self, items_total: usize);

    /// Report a progress update
    fn report_progress(&self, update: &BatchProgressUpdate);

    /// Called once after the last item
    fn report_completion(&self, items_completed: usize);
}

/// No-op progress reporter that discards all progress updates
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_start(&self, _items_total: usize) {}

    fn report_progress(&self, _update: &BatchProgressUpdate) {}

    fn report_completion(&self, _items_completed: usize) {}
}

/// Builds updates for a running batch
pub struct ProgressTracker<'a> {
    reporter: &'a dyn ProgressReporter,
    items_total: usize,
    items_completed: usize,
    start_time: Instant,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(reporter: &'a dyn ProgressReporter, items_total: usize) -> Self {
        reporter.report_start(items_total);
        Self {
            reporter,
            items_total,
            items_completed: 0,
            start_time: Instant::now(),
        }
    }

    pub fn report_stage(&self, item: &Path, stage: ItemStage) {
        self.reporter.report_progress(&self.update(item, stage));
    }

    pub fn complete_item(&mut self, item: &Path) {
        self.items_completed += 1;
        self.reporter.report_progress(&self.update(item, ItemStage::Saving));
    }

    pub fn finish(&self) {
        self.reporter.report_completion(self.items_completed);
    }

    fn update(&self, item: &Path, stage: ItemStage) -> BatchProgressUpdate {
        BatchProgressUpdate {
            items_completed: self.items_completed,
            items_total: self.items_total,
            current_item: item.to_path_buf(),
            stage,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_from_completed_items() {
        let update = BatchProgressUpdate {
            items_completed: 2,
            items_total: 5,
            current_item: PathBuf::from("b.png"),
            stage: ItemStage::Saving,
            elapsed_seconds: 10.0,
        };
        assert_eq!(update.eta_seconds(), Some(15));

        let fresh = BatchProgressUpdate {
            items_completed: 0,
            ..update
        };
        assert_eq!(fresh.eta_seconds(), None);
    }

    #[test]
    fn test_stage_descriptions() {
        assert_eq!(ItemStage::Relighting.description(), "Relighting");
        assert_eq!(ItemStage::Loading.description(), "Loading image");
    }
}
