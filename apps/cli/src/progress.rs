//! Progress bar utilities for CLI downloads

use crate::output::short_url;
use console::style;
use imgfetch_types::DownloadProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Manages progress bars for a batch of downloads
pub struct FetchProgress {
    multi: MultiProgress,
}

impl FetchProgress {
    /// Bars are only drawn when `visible` is set
    pub fn new(visible: bool) -> Self {
        let multi = MultiProgress::new();
        if !visible {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self { multi }
    }

    /// Create a progress bar for one URL
    pub fn add(&self, url: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:40} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(short_url(url, 40));
        pb
    }
}

/// Apply a progress report to a bar
pub fn update(pb: &ProgressBar, progress: DownloadProgress) {
    if let Some(total) = progress.expected {
        pb.set_length(total);
    } else if pb.length().unwrap_or(0) < progress.received {
        pb.set_length(progress.received);
    }
    pb.set_position(progress.received);
}

pub fn finish_ok(pb: &ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", style("✓").green().bold(), message));
}

pub fn finish_failed(pb: &ProgressBar, error: &str) {
    pb.abandon_with_message(format!("{} Failed: {}", style("✗").red().bold(), error));
}

pub fn finish_cancelled(pb: &ProgressBar) {
    pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
}
