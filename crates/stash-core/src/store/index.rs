// Index layout, connections and locking for the file store.
use std::{
    fs::{self, OpenOptions},
    io::ErrorKind,
    time::Duration,
};

use anyhow::{Context, Result};
use fs4::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{FileStore, StoreError, StoreLock, ARCHIVES_DIR, LOCKS_DIR, TMP_DIR};

const SCHEMA_VERSION: u32 = 1;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_stash_version";
const STASH_VERSION: &str = env!("CARGO_PKG_VERSION");

impl FileStore {
    pub(super) fn ensure_layout(&self) -> Result<()> {
        for dir in [ARCHIVES_DIR, LOCKS_DIR, TMP_DIR] {
            fs::create_dir_all(self.root.join(dir)).with_context(|| {
                format!(
                    "failed to ensure store directory {}",
                    self.root.join(dir).display()
                )
            })?;
        }
        let mut conn = self.connection()?;
        init_schema(&conn)?;
        ensure_meta(&mut conn)?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        let conn = self.connection_raw()?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for store index")?;
        Ok(conn)
    }

    pub(crate) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start store index transaction")?;
        let result = f(&tx)?;
        tx.commit().context("failed to commit store index transaction")?;
        Ok(result)
    }

    fn connection_raw(&self) -> Result<Connection> {
        let path = self.index_path();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open store index at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for store index")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for store index")?;
        Ok(conn)
    }

    /// Shared side of the store-wide GC lock. Writers hold it so a
    /// collection never runs underneath them.
    pub(crate) fn lock_shared(&self) -> Result<StoreLock> {
        let path = self.gc_lock_path();
        let file = open_lock_file(&path)?;
        file.lock_shared()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(StoreLock { _file: file })
    }

    /// Exclusive side of the store-wide GC lock, without waiting. `None` when
    /// another collection or a writer holds it.
    pub fn try_lock_gc(&self) -> Result<Option<StoreLock>> {
        let path = self.gc_lock_path();
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StoreLock { _file: file })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to lock {}", path.display())),
        }
    }
}

fn open_lock_file(path: &std::path::Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create store lock directory {}", parent.display())
        })?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open store lock {}", path.display()))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS archived_files (
            hash TEXT NOT NULL,
            archive TEXT NOT NULL,
            offset INTEGER NOT NULL,
            len INTEGER NOT NULL,
            size INTEGER NOT NULL,
            PRIMARY KEY(hash, archive)
        );
        CREATE INDEX IF NOT EXISTS idx_archived_files_archive ON archived_files(archive);
        CREATE TABLE IF NOT EXISTS owners (
            owner_type TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            retired INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY(owner_type, owner_id)
        );
        CREATE TABLE IF NOT EXISTS refs (
            owner_type TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY(owner_type, owner_id, hash),
            FOREIGN KEY(owner_type, owner_id) REFERENCES owners(owner_type, owner_id)
                ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_refs_hash ON refs(hash);
        "#,
    )
    .context("failed to initialize store index schema")?;
    Ok(())
}

fn ensure_meta(conn: &mut Connection) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start store index transaction")?;
    tx.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params![META_KEY_CREATED_BY, STASH_VERSION],
    )?;
    let found: Option<String> = tx
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![META_KEY_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    let expected = SCHEMA_VERSION.to_string();
    match found {
        Some(found) if found == expected => {}
        Some(found) => {
            return Err(StoreError::IncompatibleSchema { expected, found }.into());
        }
        None => {
            return Err(StoreError::IncompatibleSchema {
                expected,
                found: "<missing>".to_string(),
            }
            .into());
        }
    }
    tx.commit()?;
    Ok(())
}
