//! Mark-and-sweep collector over a set of archives.
//!
//! The collector only decides. Bytes are read and written by the repack
//! callback handed to [`Collector::collect`].
//!
//! An entry is kept when its hash is referenced, unless the caller detached
//! it from that one archive because the store's metadata no longer points
//! there (see [`Collector::detach`]).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::hash::ContentHash;
use crate::header::{FileEntry, HeaderView};
use crate::progress::{CancelFlag, ProgressSink, ProgressSlice, ProgressSlicer};
use crate::reference::ReferenceSet;
use crate::repack::{ArchiveAction, ArchiveDecision, RepackError, RepackOutcome};


/// Errors surfaced by the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("[STASH201] archive {} is already registered for this run", location.display())]
    DuplicateArchive { location: PathBuf },
    #[error("[STASH202] hash {hash} is not stored in any registered archive")]
    UnknownHash { hash: ContentHash },
    #[error(
        "[STASH203] garbage collection aborted at {} after {processed} archive(s): {reason:#}",
        location.display()
    )]
    Aborted {
        location: PathBuf,
        processed: usize,
        reason: anyhow::Error,
    },
    #[error("[STASH204] repack of {} broke the repack contract: {detail}", location.display())]
    ContractViolation { location: PathBuf, detail: String },
    #[error("[STASH205] archive {} is not registered for this run", location.display())]
    UnknownArchive { location: PathBuf },
}

impl CollectorError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateArchive { .. } => "STASH201",
            Self::UnknownHash { .. } => "STASH202",
            Self::Aborted { .. } => "STASH203",
            Self::ContractViolation { .. } => "STASH204",
            Self::UnknownArchive { .. } => "STASH205",
        }
    }
}

/// An archive registered for a single collection run.
#[derive(Debug)]
pub struct Archive<H> {
    location: PathBuf,
    header: H,
    /// Distinct hashes in header order, with their decompressed sizes.
    entries: IndexMap<ContentHash, u64>,
    detached: HashSet<ContentHash>,
}

impl<H> Archive<H> {
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    #[must_use]
    pub fn header(&self) -> &H {
        &self.header
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn hashes(&self) -> impl Iterator<Item = &ContentHash> {
        self.entries.keys()
    }

    #[must_use]
    pub fn is_detached(&self, hash: &ContentHash) -> bool {
        self.detached.contains(hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedArchive {
    pub location: PathBuf,
    pub action: ArchiveAction,
    #[serde(flatten)]
    pub decision: ArchiveDecision,
}

/// Side-effect free decisions for every registered archive, in registration
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcPlan {
    pub archives: Vec<PlannedArchive>,
}

impl GcPlan {
    /// Archives that a collection would hand to the repack callback.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedArchive> {
        self.archives
            .iter()
            .filter(|planned| planned.action != ArchiveAction::Keep)
    }

    /// The summary a run would produce if every repack succeeded.
    #[must_use]
    pub fn projected_summary(&self) -> GcSummary {
        let mut summary = GcSummary {
            scanned: self.archives.len(),
            ..GcSummary::default()
        };
        for planned in &self.archives {
            match planned.action {
                ArchiveAction::Keep => summary.unchanged += 1,
                ArchiveAction::Repack => summary.repacked += 1,
                ArchiveAction::Delete => summary.deleted += 1,
            }
            summary.dropped_entries += planned.decision.to_drop.len();
            summary.dropped_bytes += planned.decision.dropped_bytes;
        }
        summary
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedArchive {
    pub location: PathBuf,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub scanned: usize,
    pub unchanged: usize,
    pub repacked: usize,
    pub deleted: usize,
    pub skipped: Vec<SkippedArchive>,
    pub dropped_entries: usize,
    pub dropped_bytes: u64,
    pub cancelled: bool,
}

impl GcSummary {
    /// Archives that were physically rewritten or removed.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.repacked + self.deleted
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && !self.cancelled
    }
}

/// Working set for one collection run: the registered archives plus the
/// hashes marked live.
#[derive(Debug)]
pub struct Collector<H> {
    archives: Vec<Archive<H>>,
    locations: HashMap<PathBuf, usize>,
    known: HashSet<ContentHash>,
    references: ReferenceSet,
}

impl<H: HeaderView> Default for Collector<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HeaderView> Collector<H> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            archives: Vec::new(),
            locations: HashMap::new(),
            known: HashSet::new(),
            references: ReferenceSet::new(),
        }
    }

    /// Add one archive to the working set. A location can only be registered
    /// once per run; the first registration wins.
    pub fn register_archive(
        &mut self,
        location: impl Into<PathBuf>,
        header: H,
    ) -> Result<(), CollectorError> {
        let location = location.into();
        if self.locations.contains_key(&location) {
            return Err(CollectorError::DuplicateArchive { location });
        }

        let mut entries = IndexMap::with_capacity(header.entries().len());
        for entry in header.entries() {
            entries.entry(entry.hash()).or_insert(entry.size());
        }
        self.known.extend(entries.keys().copied());
        self.locations.insert(location.clone(), self.archives.len());
        self.archives.push(Archive {
            location,
            header,
            entries,
            detached: HashSet::new(),
        });
        Ok(())
    }

    /// Mark a hash as live. Hashes that no registered archive holds are
    /// accepted and simply never show up in a drop list.
    pub fn mark_referenced(&mut self, hash: ContentHash) -> bool {
        self.references.insert(hash)
    }

    /// Like [`Collector::mark_referenced`], but rejects hashes that no
    /// registered archive holds.
    pub fn mark_referenced_strict(&mut self, hash: ContentHash) -> Result<bool, CollectorError> {
        if !self.known.contains(&hash) {
            return Err(CollectorError::UnknownHash { hash });
        }
        Ok(self.references.insert(hash))
    }

    /// Drop `hash` from the archive at `location` even if it is referenced.
    ///
    /// Only valid when another copy stays reachable through the store's
    /// metadata. Returns `false` when the archive does not hold the hash.
    pub fn detach(&mut self, location: &Path, hash: ContentHash) -> Result<bool, CollectorError> {
        let index = *self
            .locations
            .get(location)
            .ok_or_else(|| CollectorError::UnknownArchive {
                location: location.to_path_buf(),
            })?;
        let archive = &mut self.archives[index];
        if !archive.entries.contains_key(&hash) {
            return Ok(false);
        }
        Ok(archive.detached.insert(hash))
    }

    #[must_use]
    pub fn is_referenced(&self, hash: &ContentHash) -> bool {
        self.references.contains(hash)
    }

    #[must_use]
    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    #[must_use]
    pub fn archives(&self) -> &[Archive<H>] {
        &self.archives
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    /// Partition one archive's entries by membership in the reference set.
    #[must_use]
    pub fn decide(&self, archive: &Archive<H>) -> ArchiveDecision {
        let mut decision = ArchiveDecision {
            to_keep: Vec::with_capacity(archive.entries.len()),
            to_drop: Vec::new(),
            dropped_bytes: 0,
        };
        for (hash, size) in &archive.entries {
            if self.references.contains(hash) && !archive.detached.contains(hash) {
                decision.to_keep.push(*hash);
            } else {
                decision.to_drop.push(*hash);
                decision.dropped_bytes = decision.dropped_bytes.saturating_add(*size);
            }
        }
        decision
    }

    #[must_use]
    pub fn plan(&self) -> GcPlan {
        let archives = self
            .archives
            .iter()
            .map(|archive| {
                let decision = self.decide(archive);
                PlannedArchive {
                    location: archive.location.clone(),
                    action: decision.action(),
                    decision,
                }
            })
            .collect();
        GcPlan { archives }
    }

    /// Run the sweep: every archive with dropped entries is handed to
    /// `repack` exactly once, in registration order.
    pub fn collect<F>(
        &self,
        progress: &dyn ProgressSink,
        repack: F,
    ) -> Result<GcSummary, CollectorError>
    where
        F: FnMut(
            &ProgressSlice<'_>,
            &ArchiveDecision,
            &Archive<H>,
        ) -> Result<RepackOutcome, RepackError>,
    {
        self.collect_until(progress, &CancelFlag::new(), repack)
    }

    /// [`Collector::collect`] that stops before the next archive once
    /// `cancel` is set.
    pub fn collect_until<F>(
        &self,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
        mut repack: F,
    ) -> Result<GcSummary, CollectorError>
    where
        F: FnMut(
            &ProgressSlice<'_>,
            &ArchiveDecision,
            &Archive<H>,
        ) -> Result<RepackOutcome, RepackError>,
    {
        let slicer = ProgressSlicer::new(progress, self.archives.len());
        let mut summary = GcSummary::default();

        for (index, archive) in self.archives.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                debug!(
                    remaining = self.archives.len() - index,
                    "garbage collection cancelled"
                );
                break;
            }
            summary.scanned += 1;
            let slice = slicer.slice(index);
            let decision = self.decide(archive);
            let action = decision.action();
            if action == ArchiveAction::Keep {
                summary.unchanged += 1;
                slice.finish();
                continue;
            }

            debug!(
                archive = %archive.location.display(),
                action = action.as_str(),
                keep = decision.to_keep.len(),
                drop = decision.to_drop.len(),
                "sweeping archive"
            );
            match repack(&slice, &decision, archive) {
                Ok(outcome) => {
                    check_outcome(archive, action, &outcome)?;
                    match outcome {
                        RepackOutcome::Replaced { .. } => summary.repacked += 1,
                        RepackOutcome::Deleted => summary.deleted += 1,
                    }
                    summary.dropped_entries += decision.to_drop.len();
                    summary.dropped_bytes += decision.dropped_bytes;
                }
                Err(RepackError::Recoverable(err)) => {
                    warn!(
                        archive = %archive.location.display(),
                        error = %format!("{err:#}"),
                        "repack failed; archive left untouched"
                    );
                    summary.skipped.push(SkippedArchive {
                        location: archive.location.clone(),
                        reason: format!("{err:#}"),
                    });
                }
                Err(RepackError::Fatal(err)) => {
                    return Err(CollectorError::Aborted {
                        location: archive.location.clone(),
                        processed: summary.processed(),
                        reason: err,
                    });
                }
            }
            slice.finish();
        }

        if !summary.cancelled {
            slicer.complete();
        }
        debug!(
            scanned = summary.scanned,
            repacked = summary.repacked,
            deleted = summary.deleted,
            skipped = summary.skipped.len(),
            dropped_bytes = summary.dropped_bytes,
            "archive gc sweep complete"
        );
        Ok(summary)
    }
}

fn check_outcome<H>(
    archive: &Archive<H>,
    action: ArchiveAction,
    outcome: &RepackOutcome,
) -> Result<(), CollectorError> {
    let detail = match (action, outcome) {
        (ArchiveAction::Repack, RepackOutcome::Deleted) => {
            "archive still holds live entries but no replacement was produced"
        }
        (ArchiveAction::Delete, RepackOutcome::Replaced { .. }) => {
            "a replacement was written for an archive without surviving entries"
        }
        (_, RepackOutcome::Replaced { location }) if location == &archive.location => {
            "the replacement reuses the original location"
        }
        _ => return Ok(()),
    };
    Err(CollectorError::ContractViolation {
        location: archive.location.clone(),
        detail: detail.to_string(),
    })
}
