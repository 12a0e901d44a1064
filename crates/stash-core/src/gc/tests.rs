use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;

use serial_test::serial;
use tempfile::tempdir;

use super::*;
use crate::archive::{self, ArchiveBuilder};
use crate::store::{OwnerId, OwnerType, StoreError};

fn new_store() -> Result<(tempfile::TempDir, FileStore)> {
    let temp = tempdir()?;
    let store = FileStore::open(temp.path().join("store"))?;
    Ok((temp, store))
}

fn loadout(id: &str) -> OwnerId {
    OwnerId::new(OwnerType::Loadout, id)
}

fn archive_files(store: &FileStore) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(store.archives_dir())?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn gc(store: &FileStore) -> Result<GcReport> {
    run_gc(store, &GcOptions::default(), &NoProgress)
}

#[test]
fn partially_live_archive_is_replaced_losslessly() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let x = store
        .backup(&owner, [&b"file a"[..], b"file b", b"file c"])?
        .archive
        .expect("archive X");
    store.remove_owner(&owner)?;
    store.backup(&owner, [&b"file a"[..], b"file b"])?;

    let report = gc(&store)?;
    assert_eq!(report.summary.repacked, 1);
    assert_eq!(report.summary.deleted, 0);
    assert_eq!(report.summary.dropped_entries, 1);
    assert_eq!(report.summary.dropped_bytes, 6);
    assert!(!x.exists(), "original X is removed");

    let remaining = archive_files(&store)?;
    assert_eq!(remaining.len(), 1);
    let x_prime = &remaining[0];
    let header = archive::parse_header(x_prime)?;
    let hashes: Vec<_> = header.entries.iter().map(|entry| entry.hash).collect();
    assert_eq!(
        hashes,
        vec![ContentHash::of(b"file a"), ContentHash::of(b"file b")]
    );

    for payload in [&b"file a"[..], b"file b"] {
        let hash = ContentHash::of(payload);
        assert_eq!(store.read_file(&hash)?, payload);
        let locations = store.locations(&hash)?;
        assert_eq!(locations.len(), 1);
        assert_eq!(&locations[0].archive, x_prime);
    }
    assert!(!store.has_file(&ContentHash::of(b"file c"))?);
    Ok(())
}

#[test]
fn fully_dead_archive_is_deleted_without_replacement() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = OwnerId::new(OwnerType::GameBackup, "old");
    let y = store
        .backup(&owner, [b"only file"])?
        .archive
        .expect("archive Y");
    store.retire_owner(&owner)?;

    let report = gc(&store)?;
    assert_eq!(report.summary.deleted, 1);
    assert_eq!(report.summary.repacked, 0);
    assert!(!y.exists());
    assert!(archive_files(&store)?.is_empty(), "no replacement is written");
    assert!(!store.has_file(&ContentHash::of(b"only file"))?);
    Ok(())
}

#[test]
fn fully_live_archive_is_left_untouched() -> Result<()> {
    let (_temp, store) = new_store()?;
    let path = store
        .backup(&loadout("main"), [&b"one"[..], b"two"])?
        .archive
        .expect("archive");
    let before = fs::read(&path)?;

    let report = gc(&store)?;
    assert_eq!(report.summary.unchanged, 1);
    assert_eq!(report.summary.processed(), 0);
    assert_eq!(fs::read(&path)?, before);
    Ok(())
}

#[test]
fn second_run_is_a_no_op() -> Result<()> {
    let (_temp, store) = new_store()?;
    let keep = loadout("keep");
    let stale = loadout("stale");
    store.backup(&keep, [&b"kept"[..], b"shared"])?;
    store.backup(&stale, [&b"shared"[..], b"dropped"])?;
    store.retire_owner(&stale)?;

    let first = gc(&store)?;
    assert_eq!(first.summary.deleted + first.summary.repacked, 1);
    let layout = archive_files(&store)?;

    let second = gc(&store)?;
    assert_eq!(second.summary.processed(), 0);
    assert_eq!(second.summary.unchanged, layout.len());
    assert_eq!(archive_files(&store)?, layout);
    Ok(())
}

#[test]
fn live_hash_is_kept_in_every_archive_holding_it() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let first = store
        .backup(&owner, [&b"dup"[..], b"junk one"])?
        .archive
        .expect("first");
    // Index a second copy of `dup` alongside other junk.
    let mut builder = ArchiveBuilder::new();
    builder.push_content(b"dup")?;
    builder.push_content(b"junk two")?;
    let second = builder.finish(&store.tmp_dir(), &store.archives_dir())?;
    store.with_immediate_tx(|tx| {
        for entry in &second.header.entries {
            tx.execute(
                "INSERT INTO archived_files(hash, archive, offset, len, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.hash.to_hex(),
                    store.archive_key(&second.path)?,
                    entry.offset as i64,
                    entry.len as i64,
                    entry.size as i64
                ],
            )?;
        }
        Ok(())
    })?;
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"dup"])?;

    let report = gc(&store)?;
    assert_eq!(report.summary.repacked, 2);
    assert!(!first.exists() && !second.path.exists());

    let dup = ContentHash::of(b"dup");
    let locations = store.locations(&dup)?;
    assert_eq!(locations.len(), 2, "both copies survive");
    for location in &locations {
        let header = archive::parse_header(&location.archive)?;
        assert_eq!(header.entries.len(), 1);
        assert_eq!(header.entries[0].hash, dup);
    }
    Ok(())
}

#[test]
fn unindexed_replacement_left_by_a_crash_is_reclaimed() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let original = store
        .backup(&owner, [&b"live"[..], b"dead"])?
        .archive
        .expect("original");
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"live"])?;
    // A replacement written before a crash, never recorded in the index.
    let mut builder = ArchiveBuilder::new();
    builder.push_content(b"live")?;
    let crashed = builder.finish(&store.tmp_dir(), &store.archives_dir())?;

    let first = gc(&store)?;
    assert_eq!(first.reconciled.detached, 1);
    assert_eq!(first.reconciled.reindexed, 0);
    assert_eq!(first.summary.deleted, 1);
    assert_eq!(first.summary.repacked, 1);
    assert!(!crashed.path.exists(), "unindexed copy is reclaimed");
    assert!(!original.exists());

    let remaining = archive_files(&store)?;
    assert_eq!(remaining.len(), 1);
    let live = ContentHash::of(b"live");
    let locations = store.locations(&live)?;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].archive, remaining[0]);
    assert_eq!(store.read_file(&live)?, b"live");
    assert!(!store.has_file(&ContentHash::of(b"dead"))?);

    let second = gc(&store)?;
    assert_eq!(second.summary.processed(), 0);
    assert_eq!(second.reconciled, ReconcileReport::default());
    assert_eq!(archive_files(&store)?, remaining);
    Ok(())
}

#[test]
fn original_left_after_commit_is_reclaimed() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let original = store
        .backup(&owner, [&b"live"[..], b"dead"])?
        .archive
        .expect("original");
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"live"])?;
    // Index already committed to the replacement, original not yet deleted.
    let mut builder = ArchiveBuilder::new();
    builder.push_content(b"live")?;
    let replacement = builder.finish(&store.tmp_dir(), &store.archives_dir())?;
    crate::updater::apply_update(
        &store,
        &crate::updater::ArchiveUpdate {
            original: &original,
            dropped: &[ContentHash::of(b"dead")],
            replacement: Some(&replacement),
        },
    )?;

    let report = gc(&store)?;
    assert_eq!(report.reconciled.detached, 1);
    assert_eq!(report.summary.deleted, 1);
    assert!(!original.exists());
    assert_eq!(archive_files(&store)?, vec![replacement.path.clone()]);
    assert_eq!(store.read_file(&ContentHash::of(b"live"))?, b"live");
    Ok(())
}

#[test]
fn sole_unindexed_live_copy_is_reindexed_not_deleted() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let original = store.backup(&owner, [b"precious"])?.archive.expect("archive");
    let mut builder = ArchiveBuilder::new();
    builder.push_content(b"precious")?;
    let copy = builder.finish(&store.tmp_dir(), &store.archives_dir())?;
    fs::remove_file(&original)?;

    let report = gc(&store)?;
    assert_eq!(report.reconciled.reindexed, 1);
    assert_eq!(report.summary.deleted, 0);
    assert!(copy.path.exists());
    assert_eq!(store.read_file(&ContentHash::of(b"precious"))?, b"precious");
    Ok(())
}

#[test]
fn failed_index_update_aborts_and_removes_replacement() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let original = store
        .backup(&owner, [&b"keep"[..], b"toss"])?
        .archive
        .expect("archive");
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"keep"])?;

    // Another owner starts referencing `toss` while the replacement is being
    // written, so the index update must refuse to retract it.
    let armed = Cell::new(false);
    let sink = |_: f64| {
        if armed.replace(true) {
            return;
        }
        store
            .with_immediate_tx(|tx| {
                tx.execute(
                    "INSERT INTO owners(owner_type, owner_id, retired, created_at) \
                     VALUES ('loadout', 'late', 0, 0)",
                    [],
                )?;
                tx.execute(
                    "INSERT INTO refs(owner_type, owner_id, hash) VALUES ('loadout', 'late', ?1)",
                    rusqlite::params![ContentHash::of(b"toss").to_hex()],
                )?;
                Ok(())
            })
            .expect("late reference recorded");
    };

    let err = run_gc(&store, &GcOptions::default(), &sink).unwrap_err();
    assert!(armed.get(), "progress was reported before the index update");
    assert_eq!(crate::commands::error_code(&err), Some("STASH311"));
    let gc_err = err.downcast_ref::<GcError>().expect("gc error");
    assert!(matches!(
        gc_err,
        GcError::Collector(CollectorError::Aborted { .. })
    ));

    assert!(original.exists());
    assert_eq!(archive_files(&store)?, vec![original.clone()], "replacement removed");
    let keep = store.locations(&ContentHash::of(b"keep"))?;
    assert_eq!(keep.len(), 1);
    assert_eq!(keep[0].archive, original);
    assert!(store.has_file(&ContentHash::of(b"toss"))?, "index unchanged");
    Ok(())
}

#[test]
fn dry_run_reports_plan_and_changes_nothing() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    store.backup(&owner, [&b"keep"[..], b"toss"])?;
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"keep"])?;
    fs::write(store.tmp_dir().join("left.partial"), b"x")?;
    let before = archive_files(&store)?;

    let report = run_gc(
        &store,
        &GcOptions {
            dry_run: true,
            ..GcOptions::default()
        },
        &NoProgress,
    )?;
    assert!(report.dry_run);
    assert_eq!(report.summary.repacked, 1);
    let plan = report.plan.expect("plan");
    assert_eq!(plan.changes().count(), 1);
    assert_eq!(plan.archives[0].decision.to_drop, vec![ContentHash::of(b"toss")]);

    assert_eq!(archive_files(&store)?, before);
    assert!(store.has_file(&ContentHash::of(b"toss"))?);
    assert!(store.tmp_dir().join("left.partial").exists());
    Ok(())
}

#[test]
fn concurrent_run_is_rejected_as_busy() -> Result<()> {
    let (_temp, store) = new_store()?;
    let _held = store.try_lock_gc()?.expect("lock");
    let err = gc(&store).unwrap_err();
    let gc_err = err.downcast_ref::<GcError>().expect("gc error");
    assert!(matches!(gc_err, GcError::Busy { .. }));
    assert_eq!(gc_err.code(), "STASH310");
    Ok(())
}

#[test]
fn unreadable_archives_are_excluded_and_reported() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = OwnerId::new(OwnerType::GameBackup, "gone");
    store.backup(&owner, [b"content"])?;
    store.retire_owner(&owner)?;
    let broken = store.archives_dir().join("broken.stash");
    fs::write(&broken, b"STASHAR1\xff\xff")?;

    let report = gc(&store)?;
    assert_eq!(report.unreadable.len(), 1);
    assert_eq!(report.unreadable[0].path, broken);
    assert_eq!(report.summary.deleted, 1);
    assert!(broken.exists(), "unreadable archives are never touched");
    Ok(())
}

#[test]
fn failed_repack_write_leaves_original_and_index_intact() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let original = store
        .backup(&owner, [&b"keep"[..], b"toss"])?
        .archive
        .expect("archive");
    store.remove_owner(&owner)?;
    store.backup(&owner, [b"keep"])?;

    // A regular file where the temp directory should be makes every
    // container write fail.
    fs::remove_dir_all(store.tmp_dir())?;
    fs::write(store.tmp_dir(), b"in the way")?;

    let report = gc(&store)?;
    assert_eq!(report.summary.skipped.len(), 1);
    assert_eq!(report.summary.skipped[0].location, original);
    assert_eq!(report.summary.repacked, 0);
    assert_eq!(report.summary.dropped_entries, 0);
    assert!(original.exists());
    assert_eq!(archive_files(&store)?, vec![original.clone()]);
    assert!(store.has_file(&ContentHash::of(b"toss"))?, "index unchanged");
    assert_eq!(store.read_file(&ContentHash::of(b"keep"))?, b"keep");
    Ok(())
}

#[test]
fn cancelled_run_touches_nothing() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    let path = store
        .backup(&owner, [b"doomed"])?
        .archive
        .expect("archive");
    store.retire_owner(&owner)?;

    let options = GcOptions::default();
    options.cancel.cancel();
    let report = run_gc(&store, &options, &NoProgress)?;
    assert!(report.summary.cancelled);
    assert_eq!(report.summary.scanned, 0);
    assert!(path.exists());
    Ok(())
}

#[test]
fn progress_reaches_completion() -> Result<()> {
    let (_temp, store) = new_store()?;
    let owner = loadout("main");
    store.backup(&owner, [&b"a"[..], b"b"])?;
    store.backup(&loadout("other"), [b"c"])?;
    store.retire_owner(&owner)?;

    let seen = RefCell::new(Vec::new());
    let sink = |value: f64| seen.borrow_mut().push(value);
    run_gc(&store, &GcOptions::default(), &sink)?;
    let seen = seen.into_inner();
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    assert_eq!(seen.last().copied(), Some(1.0));
    Ok(())
}

#[test]
fn report_serializes_summary_fields_flat() -> Result<()> {
    let (_temp, store) = new_store()?;
    store.backup(&loadout("main"), [b"content"])?;
    let report = gc(&store)?;
    let value = serde_json::to_value(&report)?;
    assert_eq!(value["scanned"], 1);
    assert_eq!(value["unchanged"], 1);
    assert_eq!(value["dry_run"], false);
    assert!(value.get("plan").is_none());
    Ok(())
}

#[test]
#[serial]
fn env_policy_can_disable_collection() -> Result<()> {
    let (_temp, store) = new_store()?;
    let previous = std::env::var_os("STASH_GC_DISABLE");

    std::env::set_var("STASH_GC_DISABLE", "1");
    let disabled = run_gc_with_env_policy(&store);
    std::env::remove_var("STASH_GC_DISABLE");
    let enabled = run_gc_with_env_policy(&store);
    if let Some(value) = previous {
        std::env::set_var("STASH_GC_DISABLE", value);
    }

    assert!(disabled?.is_none());
    assert!(enabled?.is_some());
    Ok(())
}

#[test]
fn collector_failures_keep_their_codes() {
    let err = GcError::from(CollectorError::DuplicateArchive {
        location: Path::new("a.stash").to_path_buf(),
    });
    assert_eq!(err.code(), "STASH201");
    let store_err = StoreError::EmptyBackup;
    assert_eq!(store_err.code(), "STASH304");
}
