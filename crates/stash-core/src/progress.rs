use std::cell::Cell;
use std::io::{self, IsTerminal, Write};

use stash_domain::ProgressSink;

use crate::config::GcConfig;

/// Renders run-wide progress as a single rewritten stderr line.
pub struct ProgressReporter {
    label: String,
    enabled: bool,
    last_percent: Cell<Option<u32>>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Self {
            label: label.into(),
            enabled,
            last_percent: Cell::new(None),
        }
    }

    /// Enabled when `STASH_PROGRESS` says so, otherwise when stderr is a
    /// terminal.
    pub fn for_config(label: impl Into<String>, config: &GcConfig) -> Self {
        let enabled = config
            .progress
            .unwrap_or_else(|| io::stderr().is_terminal());
        Self::new(label, enabled)
    }

    /// Last percentage rendered, if any.
    #[must_use]
    pub fn last_percent(&self) -> Option<u32> {
        self.last_percent.get()
    }

    pub fn finish(&self) {
        if self.enabled && self.last_percent.get().is_some() {
            let _ = io::stderr().write_all(b"\r\x1b[2K");
            let _ = io::stderr().flush();
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&self, fraction: f64) {
        let percent = percent_of(fraction);
        if self.last_percent.get() == Some(percent) {
            return;
        }
        self.last_percent.set(Some(percent));
        if !self.enabled {
            return;
        }
        let line = render_line(&self.label, percent);
        let _ = io::stderr().write_all(line.as_bytes());
        let _ = io::stderr().flush();
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.finish();
    }
}

fn percent_of(fraction: f64) -> u32 {
    if fraction.is_nan() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * 100.0).floor() as u32
}

fn render_line(label: &str, percent: u32) -> String {
    format!("\r\x1b[2Kstash ▸ {label} [{percent:>3}%]")
}
