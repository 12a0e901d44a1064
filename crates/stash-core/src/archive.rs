//! The `.stash` container format.
//!
//! Layout: the 8-byte magic, a little-endian `u32` header length, a JSON
//! header, then the data section. Each entry is an independent deflate block
//! so it can be copied into another container without recompression.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stash_domain::{ContentHash, FileEntry, HeaderView};
use tracing::debug;

use crate::fsutil::fsync_dir;
use crate::store::StoreError;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"STASHAR1";
pub const ARCHIVE_EXTENSION: &str = "stash";
const PREFIX_LEN: u64 = 12;
const MAX_HEADER_LEN: u32 = 64 * 1024 * 1024;

/// One stored file inside a container. `offset` is relative to the start of
/// the data section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub hash: ContentHash,
    pub size: u64,
    pub offset: u64,
    pub len: u64,
}

impl FileEntry for ArchiveEntry {
    fn hash(&self) -> ContentHash {
        self.hash
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub entries: Vec<ArchiveEntry>,
    #[serde(skip)]
    data_start: u64,
}

impl ArchiveHeader {
    /// First entry stored under `hash`.
    #[must_use]
    pub fn entry(&self, hash: &ContentHash) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| &entry.hash == hash)
    }

    /// Absolute file offset of the data section.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    fn data_len(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.offset.saturating_add(entry.len))
            .max()
            .unwrap_or(0)
    }
}

impl HeaderView for ArchiveHeader {
    type Entry = ArchiveEntry;

    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }
}

/// Read and validate only the prefix and header of a container.
pub fn parse_header(path: &Path) -> Result<ArchiveHeader> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("failed to stat archive {}", path.display()))?
        .len();

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)
        .map_err(|_| corrupt(path, "truncated prefix"))?;
    if &magic != ARCHIVE_MAGIC {
        return Err(corrupt(path, "unrecognized magic").into());
    }
    let mut len = [0u8; 4];
    file.read_exact(&mut len)
        .map_err(|_| corrupt(path, "truncated header length"))?;
    let header_len = u32::from_le_bytes(len);
    if header_len > MAX_HEADER_LEN {
        return Err(corrupt(path, format!("header length {header_len} is too large")).into());
    }
    let mut buf = vec![0u8; header_len as usize];
    file.read_exact(&mut buf)
        .map_err(|_| corrupt(path, "truncated header"))?;

    let mut header: ArchiveHeader = serde_json::from_slice(&buf)
        .map_err(|err| corrupt(path, format!("invalid header: {err}")))?;
    header.data_start = PREFIX_LEN + u64::from(header_len);
    if header.entries.is_empty() {
        return Err(corrupt(path, "container holds no entries").into());
    }
    let data_end = header.data_start.saturating_add(header.data_len());
    if data_end > file_len {
        return Err(corrupt(
            path,
            format!("data section ends at {data_end} but the file is {file_len} bytes"),
        )
        .into());
    }
    Ok(header)
}

/// Raw compressed bytes of one entry.
pub fn read_block(path: &Path, header: &ArchiveHeader, entry: &ArchiveEntry) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    read_block_with(&mut file, path, header, entry)
}

/// Like [`read_block`], reusing an already open handle.
pub fn read_block_with(
    file: &mut File,
    path: &Path,
    header: &ArchiveHeader,
    entry: &ArchiveEntry,
) -> Result<Vec<u8>> {
    let len = usize::try_from(entry.len)
        .map_err(|_| corrupt(path, format!("block of {} bytes is too large", entry.len)))?;
    file.seek(SeekFrom::Start(header.data_start + entry.offset))
        .with_context(|| format!("failed to seek in archive {}", path.display()))?;
    let mut block = vec![0u8; len];
    file.read_exact(&mut block)
        .with_context(|| format!("failed to read block {} from {}", entry.hash, path.display()))?;
    Ok(block)
}

/// Decompress one entry and verify its size and digest.
pub fn read_entry(path: &Path, header: &ArchiveHeader, entry: &ArchiveEntry) -> Result<Vec<u8>> {
    let block = read_block(path, header, entry)?;
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0));
    DeflateDecoder::new(block.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|err| corrupt(path, format!("block {} failed to inflate: {err}", entry.hash)))?;
    if bytes.len() as u64 != entry.size {
        return Err(StoreError::SizeMismatch {
            hash: entry.hash,
            archive: path.to_path_buf(),
            expected: entry.size,
            found: bytes.len() as u64,
        }
        .into());
    }
    let actual = ContentHash::of(&bytes);
    if actual != entry.hash {
        return Err(StoreError::DigestMismatch {
            hash: entry.hash,
            archive: path.to_path_buf(),
            actual,
        }
        .into());
    }
    Ok(bytes)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::CorruptArchive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// A container that has been synced and renamed into place.
#[derive(Clone, Debug)]
pub struct WrittenArchive {
    pub path: PathBuf,
    pub header: ArchiveHeader,
}

/// Accumulates compressed blocks in memory and writes them as one container.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    entries: Vec<ArchiveEntry>,
    blocks: Vec<Vec<u8>>,
    seen: HashSet<ContentHash>,
    data_len: u64,
}

impl ArchiveBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.seen.contains(hash)
    }

    /// Compress and add file content. Content already in the builder is
    /// skipped.
    pub fn push_content(&mut self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        if self.seen.contains(&hash) {
            return Ok(hash);
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .with_context(|| format!("failed to compress {hash}"))?;
        let block = encoder
            .finish()
            .with_context(|| format!("failed to compress {hash}"))?;
        self.push_block(hash, bytes.len() as u64, block);
        Ok(hash)
    }

    /// Add an already compressed block verbatim. Returns `false` when the
    /// hash is already present.
    pub fn push_block(&mut self, hash: ContentHash, size: u64, block: Vec<u8>) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        let len = block.len() as u64;
        self.entries.push(ArchiveEntry {
            hash,
            size,
            offset: self.data_len,
            len,
        });
        self.data_len += len;
        self.blocks.push(block);
        true
    }

    /// Write through `tmp_dir` and atomically move the container into
    /// `dest_dir`. Empty containers are never written.
    pub fn finish(self, tmp_dir: &Path, dest_dir: &Path) -> Result<WrittenArchive> {
        if self.entries.is_empty() {
            bail!("refusing to write an archive without entries");
        }
        let name = archive_name(self.entries.iter().map(|entry| &entry.hash));
        let dest = dest_dir.join(&name);
        if dest.exists() {
            bail!("archive {} already exists", dest.display());
        }
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("failed to create archive directory {}", dest_dir.display()))?;
        fs::create_dir_all(tmp_dir)
            .with_context(|| format!("failed to create temp directory {}", tmp_dir.display()))?;

        let mut header = ArchiveHeader {
            entries: self.entries,
            data_start: 0,
        };
        let encoded = serde_json::to_vec(&header).context("failed to encode archive header")?;
        let header_len = u32::try_from(encoded.len())
            .ok()
            .filter(|len| *len <= MAX_HEADER_LEN)
            .context("archive header is too large")?;
        header.data_start = PREFIX_LEN + u64::from(header_len);

        let tmp = tmp_dir.join(format!("{name}.partial"));
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create temp archive {}", tmp.display()))?;
            file.write_all(ARCHIVE_MAGIC)
                .and_then(|()| file.write_all(&header_len.to_le_bytes()))
                .and_then(|()| file.write_all(&encoded))
                .with_context(|| format!("failed to write temp archive {}", tmp.display()))?;
            for block in &self.blocks {
                file.write_all(block)
                    .with_context(|| format!("failed to write temp archive {}", tmp.display()))?;
            }
            file.sync_all()
                .with_context(|| format!("failed to flush temp archive {}", tmp.display()))?;
        }
        fsync_dir(tmp_dir).ok();

        if let Err(err) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| {
                format!(
                    "failed to move archive into place ({} -> {})",
                    tmp.display(),
                    dest.display()
                )
            });
        }
        fsync_dir(dest_dir).ok();

        debug!(
            archive = %dest.display(),
            entries = header.entries.len(),
            "archive written"
        );
        Ok(WrittenArchive { path: dest, header })
    }
}

/// `<sha256 of the entry hashes>-<unix nanos>.stash`
fn archive_name<'a>(hashes: impl Iterator<Item = &'a ContentHash>) -> String {
    let mut digest = Sha256::new();
    for hash in hashes {
        digest.update(hash.as_bytes());
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "{}-{nanos}.{ARCHIVE_EXTENSION}",
        hex::encode(digest.finalize())
    )
}
