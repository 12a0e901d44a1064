//! The contract between the collector and a format-specific repack function.
//!
//! A repack callback receives the decision for one archive. When `to_keep` is
//! non-empty it must write exactly one new container holding those entries
//! (content and size unchanged) at a location distinct from the original, and
//! only then remove the original. When `to_keep` is empty it removes the
//! original and writes nothing.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::hash::ContentHash;

/// What a collection run does to one archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveAction {
    Keep,
    Repack,
    Delete,
}

impl ArchiveAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Repack => "repack",
            Self::Delete => "delete",
        }
    }
}

/// Partition of one archive's entries. Both lists follow header order and
/// together hold every distinct hash of the archive exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveDecision {
    pub to_keep: Vec<ContentHash>,
    pub to_drop: Vec<ContentHash>,
    /// Decompressed bytes held by the `to_drop` entries.
    pub dropped_bytes: u64,
}

impl ArchiveDecision {
    #[must_use]
    pub fn action(&self) -> ArchiveAction {
        if self.to_drop.is_empty() {
            ArchiveAction::Keep
        } else if self.to_keep.is_empty() {
            ArchiveAction::Delete
        } else {
            ArchiveAction::Repack
        }
    }

    #[must_use]
    pub fn requires_change(&self) -> bool {
        !self.to_drop.is_empty()
    }
}

/// Result of a successful repack callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepackOutcome {
    /// A replacement container was written; the original is gone.
    Replaced { location: PathBuf },
    /// Every entry was dropped; the original is gone and nothing replaced it.
    Deleted,
}

impl RepackOutcome {
    #[must_use]
    pub fn new_location(&self) -> Option<&Path> {
        match self {
            Self::Replaced { location } => Some(location),
            Self::Deleted => None,
        }
    }
}

/// Failure reported by a repack callback.
#[derive(Debug, thiserror::Error)]
pub enum RepackError {
    /// The original archive is untouched and its metadata was not modified;
    /// the run continues and a later run retries it.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// Continuing could leave metadata pointing at a deleted archive or drop
    /// live data. The run stops.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl RepackError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    #[must_use]
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Recoverable(err) | Self::Fatal(err) => err,
        }
    }
}
