#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Collection, decision and repack orchestration for content-addressed
//! archive stores.
//!
//! Callers register every archive of a run with a [`Collector`], mark the
//! hashes that are still live, then call [`Collector::collect`] with a repack
//! callback. Archives that only hold live entries are never handed to the
//! callback.

pub mod collector;
pub mod hash;
pub mod header;
pub mod progress;
pub mod reference;
pub mod repack;

pub use collector::{
    Archive, Collector, CollectorError, GcPlan, GcSummary, PlannedArchive, SkippedArchive,
};
pub use hash::{ContentHash, HashParseError, HASH_LEN};
pub use header::{FileEntry, HeaderView};
pub use progress::{CancelFlag, NoProgress, ProgressSink, ProgressSlice};
pub use reference::ReferenceSet;
pub use repack::{ArchiveAction, ArchiveDecision, RepackError, RepackOutcome};
