//! File store: a directory of `.stash` containers plus a SQLite index that
//! maps content hashes to the archives holding them and records which owners
//! reference which hashes.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use indexmap::IndexSet;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use stash_domain::ContentHash;
use tracing::{debug, warn};

use crate::archive::{self, ArchiveBuilder, ArchiveEntry, WrittenArchive};
use crate::diagnostics;

mod index;


pub(crate) const ARCHIVES_DIR: &str = "archives";
pub(crate) const TMP_DIR: &str = "tmp";
pub(crate) const LOCKS_DIR: &str = "locks";
const INDEX_FILENAME: &str = "index.sqlite";
const GC_LOCK_FILENAME: &str = "gc.lock";

/// Errors surfaced by the file store.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[STASH301] file {hash} is not stored in any archive")]
    MissingFile { hash: ContentHash },
    #[error("[STASH301] file {hash} in {} has digest {actual}", archive.display())]
    DigestMismatch {
        hash: ContentHash,
        archive: PathBuf,
        actual: ContentHash,
    },
    #[error(
        "[STASH301] file {hash} in {} size mismatch (expected {expected}, found {found})",
        archive.display()
    )]
    SizeMismatch {
        hash: ContentHash,
        archive: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("[STASH302] archive {} is corrupt: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },
    #[error("[STASH303] store index is corrupt: {0}")]
    IndexCorrupt(String),
    #[error("[STASH304] unknown owner type '{0}' (expected `loadout` or `game-backup`)")]
    UnknownOwnerType(String),
    #[error("[STASH304] invalid owner '{0}' (expected TYPE:ID)")]
    InvalidOwner(String),
    #[error("[STASH304] owner {0} is not registered")]
    UnknownOwner(String),
    #[error("[STASH304] a backup needs at least one file")]
    EmptyBackup,
    #[error("[STASH305] store index schema is incompatible: expected {expected}, found {found}")]
    IncompatibleSchema { expected: String, found: String },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingFile { .. } | Self::DigestMismatch { .. } | Self::SizeMismatch { .. } => {
                diagnostics::store::MISSING_OR_CORRUPT
            }
            Self::CorruptArchive { .. } => diagnostics::store::ARCHIVE_CORRUPT,
            Self::IndexCorrupt(_) => diagnostics::store::INDEX_CORRUPT,
            Self::UnknownOwnerType(_)
            | Self::InvalidOwner(_)
            | Self::UnknownOwner(_)
            | Self::EmptyBackup => diagnostics::store::INVALID_OWNER,
            Self::IncompatibleSchema { .. } => diagnostics::store::SCHEMA_INCOMPATIBLE,
        }
    }

    /// Whether the caller supplied bad input, as opposed to the store being
    /// damaged.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownOwnerType(_)
                | Self::InvalidOwner(_)
                | Self::UnknownOwner(_)
                | Self::EmptyBackup
                | Self::MissingFile { .. }
        )
    }
}

/// Owner categories whose references keep stored files live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerType {
    Loadout,
    GameBackup,
}

impl OwnerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loadout => "loadout",
            Self::GameBackup => "game-backup",
        }
    }
}

impl TryFrom<&str> for OwnerType {
    type Error = StoreError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "loadout" => Ok(Self::Loadout),
            "game-backup" => Ok(Self::GameBackup),
            other => Err(StoreError::UnknownOwnerType(other.to_string())),
        }
    }
}

/// Concrete owner identifier, written `TYPE:ID` on the command line.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    pub owner_type: OwnerType,
    pub owner_id: String,
}

impl OwnerId {
    pub fn new(owner_type: OwnerType, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type,
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_type.as_str(), self.owner_id)
    }
}

impl FromStr for OwnerId {
    type Err = StoreError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, id) = value
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidOwner(value.to_string()))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(StoreError::InvalidOwner(value.to_string()));
        }
        Ok(Self {
            owner_type: OwnerType::try_from(kind.trim())?,
            owner_id: id.to_string(),
        })
    }
}

/// Where the index says a file lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileLocation {
    pub archive: PathBuf,
    pub offset: u64,
    pub len: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupReceipt {
    pub owner: OwnerId,
    /// Container written for content the store did not hold yet.
    pub archive: Option<PathBuf>,
    pub hashes: Vec<ContentHash>,
    pub new_files: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OwnerRecord {
    pub owner: OwnerId,
    pub retired: bool,
    pub refs: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub archives: usize,
    pub files: usize,
    pub stored_bytes: u64,
    pub owners: usize,
    pub retired_owners: usize,
    pub live_files: usize,
}

#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open the store rooted at `root`, creating its layout and index when
    /// missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        store.ensure_layout()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn archives_dir(&self) -> PathBuf {
        self.root.join(ARCHIVES_DIR)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    pub(crate) fn gc_lock_path(&self) -> PathBuf {
        self.root.join(LOCKS_DIR).join(GC_LOCK_FILENAME)
    }

    /// Index key of an archive: its path relative to `archives/`.
    pub(crate) fn archive_key(&self, path: &Path) -> Result<String> {
        let archives = self.archives_dir();
        let relative = path.strip_prefix(&archives).with_context(|| {
            format!(
                "archive {} is outside the store at {}",
                path.display(),
                archives.display()
            )
        })?;
        Ok(relative.to_string_lossy().replace('\\', "/"))
    }

    pub(crate) fn archive_path(&self, key: &str) -> PathBuf {
        self.archives_dir().join(key)
    }

    /// Store the distinct content of `files` for `owner`. Content the store
    /// already holds is only referenced; the rest goes into one new archive.
    /// Backing up for a retired owner makes it live again.
    pub fn backup<I, B>(&self, owner: &OwnerId, files: I) -> Result<BackupReceipt>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let _lock = self.lock_shared()?;
        let conn = self.connection()?;
        let mut hashes = IndexSet::new();
        let mut builder = ArchiveBuilder::new();
        for bytes in files {
            let bytes = bytes.as_ref();
            let hash = ContentHash::of(bytes);
            if !hashes.insert(hash) || has_file_with_conn(&conn, &hash)? {
                continue;
            }
            builder.push_content(bytes)?;
        }
        drop(conn);
        if hashes.is_empty() {
            return Err(StoreError::EmptyBackup.into());
        }

        let new_files = builder.len();
        let written = if builder.is_empty() {
            None
        } else {
            Some(builder.finish(&self.tmp_dir(), &self.archives_dir())?)
        };

        let recorded = self.with_immediate_tx(|tx| {
            upsert_owner(tx, owner)?;
            if let Some(written) = &written {
                self.insert_archive_rows(tx, written)?;
            }
            for hash in &hashes {
                tx.execute(
                    "INSERT OR IGNORE INTO refs(owner_type, owner_id, hash) VALUES (?1, ?2, ?3)",
                    params![owner.owner_type.as_str(), owner.owner_id, hash.to_hex()],
                )?;
            }
            Ok(())
        });
        if let Err(err) = recorded {
            if let Some(written) = &written {
                if let Err(cleanup) = fs::remove_file(&written.path) {
                    warn!(
                        archive = %written.path.display(),
                        error = %cleanup,
                        "failed to remove archive after index update failed"
                    );
                }
            }
            return Err(err);
        }

        debug!(
            %owner,
            files = hashes.len(),
            new_files,
            "backup recorded"
        );
        Ok(BackupReceipt {
            owner: owner.clone(),
            archive: written.map(|written| written.path),
            hashes: hashes.into_iter().collect(),
            new_files,
        })
    }

    fn insert_archive_rows(
        &self,
        tx: &rusqlite::Transaction<'_>,
        written: &WrittenArchive,
    ) -> Result<()> {
        let key = self.archive_key(&written.path)?;
        for entry in &written.header.entries {
            insert_entry_row(tx, &key, entry)?;
        }
        Ok(())
    }

    /// Every `(hash, archive)` pair the index records, keyed by hash.
    pub(crate) fn archive_index(&self) -> Result<HashMap<ContentHash, HashSet<PathBuf>>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT hash, archive FROM archived_files")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut index: HashMap<ContentHash, HashSet<PathBuf>> = HashMap::new();
        for (hash, key) in rows {
            index
                .entry(parse_index_hash(&hash)?)
                .or_default()
                .insert(self.archive_path(&key));
        }
        Ok(index)
    }

    /// Record that `archive` holds `entry`. Existing rows are left alone.
    pub(crate) fn index_entry(&self, archive: &Path, entry: &ArchiveEntry) -> Result<()> {
        let key = self.archive_key(archive)?;
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO archived_files(hash, archive, offset, len, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.hash.to_hex(),
                    key,
                    entry.offset as i64,
                    entry.len as i64,
                    entry.size as i64
                ],
            )?;
            Ok(())
        })
    }

    /// Attach an owner reference to a stored file.
    pub fn add_ref(&self, owner: &OwnerId, hash: &ContentHash) -> Result<()> {
        let _lock = self.lock_shared()?;
        self.with_immediate_tx(|tx| {
            if !has_file_with_conn(tx, hash)? {
                return Err(StoreError::MissingFile { hash: *hash }.into());
            }
            upsert_owner(tx, owner)?;
            tx.execute(
                "INSERT OR IGNORE INTO refs(owner_type, owner_id, hash) VALUES (?1, ?2, ?3)",
                params![owner.owner_type.as_str(), owner.owner_id, hash.to_hex()],
            )?;
            Ok(())
        })
    }

    /// Mark an owner as no longer live. Its references stay recorded but no
    /// longer protect anything from collection.
    pub fn retire_owner(&self, owner: &OwnerId) -> Result<bool> {
        self.with_immediate_tx(|tx| {
            let updated = tx.execute(
                "UPDATE owners SET retired = 1 WHERE owner_type = ?1 AND owner_id = ?2",
                params![owner.owner_type.as_str(), owner.owner_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Forget an owner and all of its references.
    pub fn remove_owner(&self, owner: &OwnerId) -> Result<bool> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "DELETE FROM refs WHERE owner_type = ?1 AND owner_id = ?2",
                params![owner.owner_type.as_str(), owner.owner_id],
            )?;
            let removed = tx.execute(
                "DELETE FROM owners WHERE owner_type = ?1 AND owner_id = ?2",
                params![owner.owner_type.as_str(), owner.owner_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn has_file(&self, hash: &ContentHash) -> Result<bool> {
        let conn = self.connection()?;
        has_file_with_conn(&conn, hash)
    }

    /// Every archive the index lists for `hash`, ordered by archive key.
    pub fn locations(&self, hash: &ContentHash) -> Result<Vec<FileLocation>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT archive, offset, len, size FROM archived_files \
             WHERE hash = ?1 ORDER BY archive",
        )?;
        let rows = stmt
            .query_map(params![hash.to_hex()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(key, offset, len, size)| FileLocation {
                archive: self.archive_path(&key),
                offset,
                len,
                size,
            })
            .collect())
    }

    /// Load and verify a stored file, trying each archive that holds it.
    pub fn read_file(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut last_err = None;
        for location in self.locations(hash)? {
            let entry = ArchiveEntry {
                hash: *hash,
                size: location.size,
                offset: location.offset,
                len: location.len,
            };
            let read = archive::parse_header(&location.archive)
                .and_then(|header| archive::read_entry(&location.archive, &header, &entry));
            match read {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    warn!(
                        %hash,
                        archive = %location.archive.display(),
                        error = %format!("{err:#}"),
                        "stored copy unreadable"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::MissingFile { hash: *hash }.into()))
    }

    pub fn owners(&self) -> Result<Vec<OwnerRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT o.owner_type, o.owner_id, o.retired, \
             (SELECT COUNT(*) FROM refs r \
              WHERE r.owner_type = o.owner_type AND r.owner_id = o.owner_id) \
             FROM owners o ORDER BY o.owner_type, o.owner_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get::<_, i64>(3)? as usize,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(owner_type, owner_id, retired, refs)| -> Result<OwnerRecord> {
                Ok(OwnerRecord {
                    owner: OwnerId {
                        owner_type: OwnerType::try_from(owner_type.as_str())?,
                        owner_id,
                    },
                    retired,
                    refs,
                })
            })
            .collect()
    }

    /// Hashes referenced by at least one owner that is not retired.
    pub fn live_hashes(&self) -> Result<Vec<ContentHash>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.hash FROM refs r \
             JOIN owners o ON o.owner_type = r.owner_type AND o.owner_id = r.owner_id \
             WHERE o.retired = 0 ORDER BY r.hash",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(String::as_str).map(parse_index_hash).collect()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.connection()?;
        let (archives, files, stored_bytes): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(DISTINCT archive), COUNT(DISTINCT hash), COALESCE(SUM(size), 0) \
             FROM archived_files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let (owners, retired_owners): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(retired), 0) FROM owners",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let live_files: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT r.hash) FROM refs r \
             JOIN owners o ON o.owner_type = r.owner_type AND o.owner_id = r.owner_id \
             WHERE o.retired = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreStats {
            archives: archives as usize,
            files: files as usize,
            stored_bytes: stored_bytes as u64,
            owners: owners as usize,
            retired_owners: retired_owners as usize,
            live_files: live_files as usize,
        })
    }

    /// Remove leftovers of interrupted writes from `tmp/`. Only safe while the
    /// exclusive GC lock is held.
    pub(crate) fn sweep_partials(&self) -> Result<usize> {
        let tmp = self.tmp_dir();
        if !tmp.is_dir() {
            return Ok(0);
        }
        let entries = match fs::read_dir(&tmp) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", tmp.display()))
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("partial") {
                continue;
            }
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn upsert_owner(conn: &Connection, owner: &OwnerId) -> Result<()> {
    conn.execute(
        "INSERT INTO owners(owner_type, owner_id, retired, created_at) VALUES (?1, ?2, 0, ?3) \
         ON CONFLICT(owner_type, owner_id) DO UPDATE SET retired = 0",
        params![
            owner.owner_type.as_str(),
            owner.owner_id,
            crate::fsutil::timestamp_secs() as i64
        ],
    )?;
    Ok(())
}

fn insert_entry_row(conn: &Connection, key: &str, entry: &ArchiveEntry) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO archived_files(hash, archive, offset, len, size) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.hash.to_hex(),
            key,
            entry.offset as i64,
            entry.len as i64,
            entry.size as i64
        ],
    )?;
    Ok(())
}

fn has_file_with_conn(conn: &Connection, hash: &ContentHash) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM archived_files WHERE hash = ?1 LIMIT 1",
            params![hash.to_hex()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn parse_index_hash(hex: &str) -> Result<ContentHash> {
    hex.parse::<ContentHash>()
        .map_err(|err| StoreError::IndexCorrupt(format!("invalid hash '{hex}': {err}")).into())
}

/// Lock handle that releases on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}
