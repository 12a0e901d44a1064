//! Brings discovered containers and the store index back in line after an
//! interrupted collection or backup.
//!
//! A container entry with no index row for that container is either a copy the
//! index already places in another readable archive, in which case it is
//! detached from this one and dropped with it, or the only copy of live
//! content, in which case it is indexed where it sits.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use stash_domain::{Collector, ContentHash, FileEntry, HeaderView};
use tracing::{debug, info};

use crate::archive::{ArchiveEntry, ArchiveHeader};
use crate::gc::GcError;
use crate::store::FileStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub detached: usize,
    pub reindexed: usize,
}

enum Action {
    Detach(PathBuf, ContentHash),
    Reindex(PathBuf, ArchiveEntry),
}

/// Reconcile every registered archive against the index. Must run after the
/// live hashes are marked. With `dry_run` nothing is written to the index.
pub fn reconcile_unindexed(
    store: &FileStore,
    collector: &mut Collector<ArchiveHeader>,
    dry_run: bool,
) -> Result<ReconcileReport> {
    let mut index = store.archive_index()?;
    let readable: HashSet<PathBuf> = collector
        .archives()
        .iter()
        .map(|archive| archive.location().to_path_buf())
        .collect();

    let mut actions = Vec::new();
    for archive in collector.archives() {
        let location = archive.location();
        for entry in archive.header().entries() {
            let hash = entry.hash();
            let holders = index.entry(hash).or_default();
            if holders.contains(location) {
                continue;
            }
            if holders.iter().any(|holder| readable.contains(holder)) {
                actions.push(Action::Detach(location.to_path_buf(), hash));
            } else if collector.is_referenced(&hash) {
                holders.insert(location.to_path_buf());
                actions.push(Action::Reindex(location.to_path_buf(), entry.clone()));
            }
        }
    }

    let mut report = ReconcileReport::default();
    for action in actions {
        match action {
            Action::Detach(location, hash) => {
                if collector.detach(&location, hash).map_err(GcError::from)? {
                    debug!(%hash, archive = %location.display(), "unindexed copy detached");
                    report.detached += 1;
                }
            }
            Action::Reindex(location, entry) => {
                if !dry_run {
                    store.index_entry(&location, &entry)?;
                }
                debug!(hash = %entry.hash, archive = %location.display(), "live copy indexed");
                report.reindexed += 1;
            }
        }
    }
    if report != ReconcileReport::default() {
        info!(
            detached = report.detached,
            reindexed = report.reindexed,
            dry_run,
            "reconciled archives with the store index"
        );
    }
    Ok(report)
}
