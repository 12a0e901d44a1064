//! Store-level garbage collection: discover, mark, reconcile against the
//! index, then sweep every archive with `write new -> commit index -> delete
//! original`.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use stash_domain::{
    Archive, ArchiveDecision, CancelFlag, Collector, CollectorError, ContentHash, GcPlan,
    GcSummary, NoProgress, ProgressSink, ProgressSlice, RepackError, RepackOutcome,
};
use tracing::{debug, info, warn};

use crate::archive::ArchiveHeader;
use crate::config::GcConfig;
use crate::diagnostics;
use crate::discovery::{discover_archives, UnreadableArchive};
use crate::marker::mark_live_hashes;
use crate::reconcile::{reconcile_unindexed, ReconcileReport};
use crate::repacker::{repack_archive, retire};
use crate::store::FileStore;
use crate::updater::{apply_update, ArchiveUpdate};

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("[STASH310] another collection or writer holds the store lock {}", lock.display())]
    Busy { lock: PathBuf },
    #[error(
        "[STASH311] refusing to drop {hash} from {}: it is still referenced by {owner}",
        archive.display()
    )]
    InvariantViolation {
        hash: ContentHash,
        archive: PathBuf,
        owner: String,
    },
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

impl GcError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy { .. } => diagnostics::gc::BUSY,
            Self::InvariantViolation { .. } => diagnostics::gc::INVARIANT_VIOLATION,
            Self::Collector(err) => err.code(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GcOptions {
    /// Compute decisions without writing, deleting or updating anything.
    pub dry_run: bool,
    pub cancel: CancelFlag,
}

#[derive(Clone, Debug, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    #[serde(flatten)]
    pub summary: GcSummary,
    pub unreadable: Vec<UnreadableArchive>,
    pub live_hashes: usize,
    pub partials_removed: usize,
    pub reconciled: ReconcileReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<GcPlan>,
}

/// Run one collection over `store` under the exclusive store lock.
pub fn run_gc(
    store: &FileStore,
    options: &GcOptions,
    progress: &dyn ProgressSink,
) -> Result<GcReport> {
    let Some(_lock) = store.try_lock_gc()? else {
        return Err(GcError::Busy {
            lock: store.gc_lock_path(),
        }
        .into());
    };

    let partials_removed = if options.dry_run {
        0
    } else {
        store.sweep_partials()?
    };
    let discovery = discover_archives(store.root())?;
    let mut collector = Collector::new();
    for found in discovery.archives {
        collector
            .register_archive(found.path, found.header)
            .map_err(GcError::from)?;
    }
    let live_hashes = mark_live_hashes(store, &mut collector)?;
    let reconciled = reconcile_unindexed(store, &mut collector, options.dry_run)?;

    if options.dry_run {
        let plan = collector.plan();
        let summary = plan.projected_summary();
        progress.report(1.0);
        info!(
            scanned = summary.scanned,
            repack = summary.repacked,
            delete = summary.deleted,
            dropped_bytes = summary.dropped_bytes,
            "garbage collection dry run"
        );
        return Ok(GcReport {
            dry_run: true,
            summary,
            unreadable: discovery.unreadable,
            live_hashes,
            partials_removed,
            reconciled,
            plan: Some(plan),
        });
    }

    let summary = collector
        .collect_until(progress, &options.cancel, |slice, decision, archive| {
            sweep_archive(store, slice, decision, archive)
        })
        .map_err(GcError::from)?;

    info!(
        scanned = summary.scanned,
        repacked = summary.repacked,
        deleted = summary.deleted,
        skipped = summary.skipped.len(),
        dropped_bytes = summary.dropped_bytes,
        cancelled = summary.cancelled,
        "garbage collection finished"
    );
    Ok(GcReport {
        dry_run: false,
        summary,
        unreadable: discovery.unreadable,
        live_hashes,
        partials_removed,
        reconciled,
        plan: None,
    })
}

fn sweep_archive(
    store: &FileStore,
    slice: &ProgressSlice<'_>,
    decision: &ArchiveDecision,
    archive: &Archive<ArchiveHeader>,
) -> std::result::Result<RepackOutcome, RepackError> {
    let original = archive.location();

    if decision.to_keep.is_empty() {
        apply_update(
            store,
            &ArchiveUpdate {
                original,
                dropped: &decision.to_drop,
                replacement: None,
            },
        )
        .map_err(RepackError::fatal)?;
        retire(original).map_err(|err| {
            RepackError::recoverable(err.context("index updated but the archive was not removed"))
        })?;
        return Ok(RepackOutcome::Deleted);
    }

    let written =
        repack_archive(store, archive, decision, slice).map_err(RepackError::recoverable)?;
    let update = ArchiveUpdate {
        original,
        dropped: &decision.to_drop,
        replacement: Some(&written),
    };
    if let Err(err) = apply_update(store, &update) {
        if let Err(cleanup) = retire(&written.path) {
            warn!(
                archive = %written.path.display(),
                error = %format!("{cleanup:#}"),
                "failed to remove replacement after index update failed"
            );
        }
        return Err(RepackError::fatal(err));
    }
    retire(original).map_err(|err| {
        RepackError::recoverable(err.context("index updated but the original was not removed"))
    })?;
    debug!(
        original = %original.display(),
        replacement = %written.path.display(),
        "archive replaced"
    );
    Ok(RepackOutcome::Replaced {
        location: written.path,
    })
}

/// Run GC unless `STASH_GC_DISABLE=1`. Returns `Ok(None)` when disabled.
pub fn run_gc_with_env_policy(store: &FileStore) -> Result<Option<GcReport>> {
    let config = GcConfig::from_env();
    if config.disabled {
        debug!("garbage collection disabled by environment");
        return Ok(None);
    }
    run_gc(store, &GcOptions::default(), &NoProgress).map(Some)
}
