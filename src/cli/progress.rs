//! Terminal progress bar for batch runs

use crate::services::{BatchProgressUpdate, ProgressReporter};
use indicatif::{ProgressBar, ProgressStyle};

/// Progress reporter drawing one indicatif bar over the batch items
pub(crate) struct IndicatifProgressReporter {
    bar: ProgressBar,
}

impl IndicatifProgressReporter {
    pub(crate) fn new(visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl ProgressReporter for IndicatifProgressReporter {
    fn report_start(&self, items_total: usize) {
        self.bar.set_length(items_total as u64);
        self.bar.set_position(0);
    }

    fn report_progress(&self, update: &BatchProgressUpdate) {
        self.bar.set_position(update.items_completed as u64);
        let name = update
            .current_item
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let eta = update
            .eta_seconds()
            .map(|secs| format!(" (eta {}s)", secs))
            .unwrap_or_default();
        self.bar
            .set_message(format!("{} {}{}", update.stage.description(), name, eta));
    }

    fn report_completion(&self, items_completed: usize) {
        self.bar
            .finish_with_message(format!("Relit {} image(s)", items_completed));
    }
}
