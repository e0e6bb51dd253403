//! Optional terminal progress bar per stage.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress bar for one stage executor.
///
/// The total is not known up front: it grows as tasks are accepted from the
/// input queue and as retries are scheduled. A hidden reporter accepts every
/// call and draws nothing.
pub struct ProgressReporter {
    bar: ProgressBar,
    enabled: bool,
}

impl ProgressReporter {
    /// Creates a reporter labelled `desc`, drawn only when `enabled`.
    #[must_use]
    pub fn new(desc: &str, enabled: bool) -> Self {
        if !enabled {
            return Self::hidden();
        }

        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec})")
        {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        bar.set_message(desc.to_string());

        Self { bar, enabled: true }
    }

    /// Creates a reporter that draws nothing.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()),
            enabled: false,
        }
    }

    /// Returns true when the bar is drawn.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Grows the total.
    pub fn add_total(&self, n: u64) {
        self.bar.inc_length(n);
    }

    /// Advances the position.
    pub fn update(&self, n: u64) {
        self.bar.inc(n);
    }

    /// Returns (position, total).
    #[must_use]
    pub fn position(&self) -> (u64, u64) {
        (self.bar.position(), self.bar.length().unwrap_or(0))
    }

    /// Leaves the bar at its final state.
    pub fn finish(&self) {
        if self.enabled {
            self.bar.finish();
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.enabled)
            .field("position", &self.position())
            .finish()
    }
}
