use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::warn;

/// Template of the overall download bar
const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} images {msg}";

/// Used when the main template is rejected by the installed indicatif
const FALLBACK_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";

fn bar_style() -> ProgressStyle {
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .or_else(|e| {
            warn!("Template error with '{}': {}. Using fallback template.", BAR_TEMPLATE, e);
            ProgressStyle::default_bar().template(FALLBACK_TEMPLATE)
        })
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    style.progress_chars("=> ")
}

/// Overall image progress of the submitted posts
pub(crate) struct DownloadProgress {
    bar: ProgressBar,
}

impl DownloadProgress {
    pub(crate) fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(bar_style());
        bar.set_draw_target(ProgressDrawTarget::stderr());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub(crate) fn set_counts(&self, done: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(done);
    }

    pub(crate) fn set_speed(&self, bytes_per_second: u64) {
        self.bar.set_message(format!("{}/s", HumanBytes(bytes_per_second)));
    }

    /// Print a line above the bar
    pub(crate) fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line);
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
