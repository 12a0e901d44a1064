//! Applies one archive's collection result to the store index.

use std::path::Path;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use stash_domain::ContentHash;
use tracing::debug;

use crate::archive::WrittenArchive;
use crate::gc::GcError;
use crate::store::FileStore;

/// What changed for one original archive.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveUpdate<'a> {
    pub original: &'a Path,
    pub dropped: &'a [ContentHash],
    /// `None` when every entry was dropped.
    pub replacement: Option<&'a WrittenArchive>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub repointed: usize,
    pub retracted: usize,
}

/// Repoint surviving rows of the original archive to its replacement and
/// retract the dropped ones, all in one transaction. Rows of other archives
/// are never touched.
///
/// A dropped hash that a live owner still references and that the index
/// places in the original archive aborts the transaction with
/// [`GcError::InvariantViolation`]. Live hashes without such a row are copies
/// the index already locates elsewhere.
pub fn apply_update(store: &FileStore, update: &ArchiveUpdate<'_>) -> Result<UpdateReport> {
    let original = store.archive_key(update.original)?;
    let replacement = update
        .replacement
        .map(|written| store.archive_key(&written.path))
        .transpose()?;

    let report = store.with_immediate_tx(|tx| {
        for hash in update.dropped {
            let owner = tx
                .query_row(
                    "SELECT r.owner_type || ':' || r.owner_id FROM refs r \
                     JOIN owners o ON o.owner_type = r.owner_type AND o.owner_id = r.owner_id \
                     WHERE r.hash = ?1 AND o.retired = 0 \
                     AND EXISTS (SELECT 1 FROM archived_files f \
                                 WHERE f.hash = r.hash AND f.archive = ?2) LIMIT 1",
                    params![hash.to_hex(), original],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(owner) = owner {
                return Err(GcError::InvariantViolation {
                    hash: *hash,
                    archive: update.original.to_path_buf(),
                    owner,
                }
                .into());
            }
        }

        let mut report = UpdateReport::default();
        if let (Some(written), Some(new_key)) = (update.replacement, replacement.as_deref()) {
            for entry in &written.header.entries {
                report.repointed += tx.execute(
                    "UPDATE archived_files SET archive = ?1, offset = ?2, len = ?3 \
                     WHERE hash = ?4 AND archive = ?5",
                    params![
                        new_key,
                        entry.offset as i64,
                        entry.len as i64,
                        entry.hash.to_hex(),
                        original
                    ],
                )?;
            }
        }
        for hash in update.dropped {
            report.retracted += tx.execute(
                "DELETE FROM archived_files WHERE hash = ?1 AND archive = ?2",
                params![hash.to_hex(), original],
            )?;
        }
        Ok(report)
    })?;

    debug!(
        archive = %update.original.display(),
        repointed = report.repointed,
        retracted = report.retracted,
        "store index updated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::store::{OwnerId, OwnerType};
    use tempfile::tempdir;

    fn setup() -> Result<(tempfile::TempDir, FileStore)> {
        let temp = tempdir()?;
        let store = FileStore::open(temp.path().join("store"))?;
        Ok((temp, store))
    }

    fn write(store: &FileStore, payloads: &[&[u8]]) -> Result<WrittenArchive> {
        let mut builder = ArchiveBuilder::new();
        for payload in payloads {
            builder.push_content(payload)?;
        }
        builder.finish(&store.tmp_dir(), &store.archives_dir())
    }

    #[test]
    fn repoints_survivors_and_retracts_dropped_rows() -> Result<()> {
        let (_temp, store) = setup()?;
        let owner = OwnerId::new(OwnerType::Loadout, "main");
        let receipt = store.backup(&owner, [&b"live"[..], b"dead"])?;
        let original = receipt.archive.expect("archive");
        store.remove_owner(&owner)?;
        store.backup(&owner, [b"live"])?;

        let live = ContentHash::of(b"live");
        let dead = ContentHash::of(b"dead");
        let replacement = write(&store, &[b"live"])?;
        let report = apply_update(
            &store,
            &ArchiveUpdate {
                original: &original,
                dropped: &[dead],
                replacement: Some(&replacement),
            },
        )?;
        assert_eq!(report, UpdateReport { repointed: 1, retracted: 1 });

        let locations = store.locations(&live)?;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].archive, replacement.path);
        assert_eq!(locations[0].offset, replacement.header.entries[0].offset);
        assert!(!store.has_file(&dead)?);
        assert_eq!(store.read_file(&live)?, b"live");
        Ok(())
    }

    #[test]
    fn rows_of_other_archives_are_left_alone() -> Result<()> {
        let (_temp, store) = setup()?;
        let first = store
            .backup(&OwnerId::new(OwnerType::Loadout, "a"), [b"dup"])?
            .archive
            .expect("archive");
        // A second container holding the same content, indexed separately.
        let second = write(&store, &[b"dup"])?;
        store.with_immediate_tx(|tx| {
            let entry = &second.header.entries[0];
            tx.execute(
                "INSERT INTO archived_files(hash, archive, offset, len, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.hash.to_hex(),
                    store.archive_key(&second.path)?,
                    entry.offset as i64,
                    entry.len as i64,
                    entry.size as i64
                ],
            )?;
            Ok(())
        })?;
        store.remove_owner(&OwnerId::new(OwnerType::Loadout, "a"))?;

        let dup = ContentHash::of(b"dup");
        let report = apply_update(
            &store,
            &ArchiveUpdate {
                original: &first,
                dropped: &[dup],
                replacement: None,
            },
        )?;
        assert_eq!(report.retracted, 1);
        let locations = store.locations(&dup)?;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].archive, second.path);
        Ok(())
    }

    #[test]
    fn unknown_archive_is_a_no_op() -> Result<()> {
        let (_temp, store) = setup()?;
        store.backup(&OwnerId::new(OwnerType::Loadout, "a"), [b"kept"])?;
        let stray = store.archives_dir().join("stray.stash");
        let report = apply_update(
            &store,
            &ArchiveUpdate {
                original: &stray,
                dropped: &[ContentHash::of(b"other")],
                replacement: None,
            },
        )?;
        assert_eq!(report, UpdateReport::default());
        assert!(store.has_file(&ContentHash::of(b"kept"))?);
        Ok(())
    }

    #[test]
    fn dropping_a_live_hash_rolls_back() -> Result<()> {
        let (_temp, store) = setup()?;
        let owner = OwnerId::new(OwnerType::GameBackup, "base");
        let receipt = store.backup(&owner, [&b"still needed"[..], b"other"])?;
        let original = receipt.archive.expect("archive");
        let needed = ContentHash::of(b"still needed");
        let other = ContentHash::of(b"other");

        let err = apply_update(
            &store,
            &ArchiveUpdate {
                original: &original,
                dropped: &[other, needed],
                replacement: None,
            },
        )
        .unwrap_err();
        let gc_err = err.downcast_ref::<GcError>().expect("gc error");
        assert_eq!(gc_err.code(), "STASH311");
        assert!(err.to_string().contains("game-backup:base"), "{err}");
        assert!(store.has_file(&needed)?);
        assert!(store.has_file(&other)?, "nothing is retracted on rollback");
        Ok(())
    }

    #[test]
    fn live_copy_indexed_elsewhere_may_be_dropped() -> Result<()> {
        let (_temp, store) = setup()?;
        let owner = OwnerId::new(OwnerType::Loadout, "main");
        let indexed = store.backup(&owner, [b"shared"])?.archive.expect("archive");
        // Same content in a container the index never learned about.
        let stray = write(&store, &[b"shared"])?;

        let shared = ContentHash::of(b"shared");
        let report = apply_update(
            &store,
            &ArchiveUpdate {
                original: &stray.path,
                dropped: &[shared],
                replacement: None,
            },
        )?;
        assert_eq!(report, UpdateReport::default());
        let locations = store.locations(&shared)?;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].archive, indexed);
        Ok(())
    }
}
