use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives run-wide progress as a fraction in `0.0..=1.0`.
pub trait ProgressSink {
    fn report(&self, fraction: f64);
}

impl<F: Fn(f64)> ProgressSink for F {
    fn report(&self, fraction: f64) {
        self(fraction);
    }
}

/// Sink that discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}

/// Cooperative cancellation shared between the caller and a running
/// collection. Checked before each archive is processed.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Splits one run-wide progress stream into equal per-archive slices and
/// keeps the reported value from ever moving backwards.
pub(crate) struct ProgressSlicer<'a> {
    sink: &'a dyn ProgressSink,
    width: f64,
    high_water: Cell<f64>,
}

impl<'a> ProgressSlicer<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, slices: usize) -> Self {
        let width = if slices == 0 {
            0.0
        } else {
            1.0 / slices as f64
        };
        Self {
            sink,
            width,
            high_water: Cell::new(0.0),
        }
    }

    pub(crate) fn slice(&self, index: usize) -> ProgressSlice<'_> {
        ProgressSlice {
            slicer: self,
            start: self.width * index as f64,
            width: self.width,
        }
    }

    pub(crate) fn complete(&self) {
        self.advance(1.0);
    }

    fn advance(&self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if value > self.high_water.get() {
            self.high_water.set(value);
            self.sink.report(value);
        }
    }
}

/// The share of run-wide progress owned by a single archive.
///
/// Repack callbacks report their own progress in `0.0..=1.0`; the slice maps
/// it into the run-wide fraction.
pub struct ProgressSlice<'a> {
    slicer: &'a ProgressSlicer<'a>,
    start: f64,
    width: f64,
}

impl ProgressSlice<'_> {
    pub fn report(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.slicer.advance(self.start + self.width * fraction);
    }

    pub fn finish(&self) {
        self.report(1.0);
    }
}
