use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Stages reported by the long-running ensemble workflows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SweepStage {
    Bagging,
    Smoothing,
}

impl SweepStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Bagging => "bootstrap trials",
            Self::Smoothing => "phase correction",
        }
    }
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer notified from worker threads while a sweep runs.
pub trait SweepProgress: Sync {
    fn on_stage_start(&self, stage: SweepStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&self, stage: SweepStage, completed_units: usize) {
        let _ = (stage, completed_units);
    }
    fn on_stage_finish(&self, stage: SweepStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopSweepProgress;

impl SweepProgress for NoopSweepProgress {}

/// Terminal progress bar on stderr; hidden when stderr is not a terminal.
pub struct ConsoleSweepProgress {
    bar: ProgressBar,
}

impl ConsoleSweepProgress {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl Default for ConsoleSweepProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepProgress for ConsoleSweepProgress {
    fn on_stage_start(&self, stage: SweepStage, total_units: usize) {
        self.bar.reset();
        self.bar.set_length(total_units as u64);
        self.bar.set_message(stage.describe());
    }

    fn on_stage_advance(&self, _stage: SweepStage, completed_units: usize) {
        self.bar.inc(completed_units as u64);
    }

    fn on_stage_finish(&self, stage: SweepStage) {
        self.bar.finish_with_message(format!("{stage} done"));
    }
}
