// src/progress.rs

//! Progress bars for installation and run scheduling.

use indicatif::{ProgressBar, ProgressStyle};

/// A bar of `len` steps, or a hidden one when progress is disabled.
///
/// Hidden bars still count, so callers can tick unconditionally.
pub fn progress_bar(len: u64, message: impl Into<String>, enabled: bool) -> ProgressBar {
    if !enabled {
        let bar = ProgressBar::hidden();
        bar.set_length(len);
        return bar;
    }

    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg:>12} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message(message.into());
    bar
}

/// Restart a bar for the next phase (e.g. the next run stage).
pub fn reset_progress(bar: &ProgressBar, len: u64, message: impl Into<String>) {
    bar.reset();
    bar.set_length(len);
    bar.set_message(message.into());
}
