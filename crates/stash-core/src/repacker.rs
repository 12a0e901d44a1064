//! Rewrites a container so it only holds the entries a collection keeps.

use std::{fs::File, path::Path};

use anyhow::{bail, Context, Result};
use stash_domain::{Archive, ArchiveDecision, ProgressSlice};
use tracing::debug;

use crate::archive::{self, ArchiveBuilder, ArchiveHeader, WrittenArchive};
use crate::fsutil::remove_file_synced;
use crate::store::FileStore;

/// Share of an archive's progress slice spent copying blocks; the rest
/// covers the final write.
const COPY_SHARE: f64 = 0.9;

/// Copy the kept entries' compressed blocks byte-for-byte into a fresh
/// container under `archives/`. The original is left in place; see
/// [`retire`].
pub fn repack_archive(
    store: &FileStore,
    archive: &Archive<ArchiveHeader>,
    decision: &ArchiveDecision,
    progress: &ProgressSlice<'_>,
) -> Result<WrittenArchive> {
    if decision.to_keep.is_empty() {
        bail!(
            "nothing to keep in {}; the archive should be deleted instead",
            archive.location().display()
        );
    }
    let source = archive.location();
    let header = archive.header();
    let mut file =
        File::open(source).with_context(|| format!("failed to open archive {}", source.display()))?;

    let mut builder = ArchiveBuilder::new();
    let total = decision.to_keep.len() as f64;
    for (index, hash) in decision.to_keep.iter().enumerate() {
        let entry = header.entry(hash).with_context(|| {
            format!("entry {hash} is missing from the header of {}", source.display())
        })?;
        let block = archive::read_block_with(&mut file, source, header, entry)?;
        builder.push_block(entry.hash, entry.size, block);
        progress.report(COPY_SHARE * (index + 1) as f64 / total);
    }
    drop(file);

    let written = builder.finish(&store.tmp_dir(), &store.archives_dir())?;
    debug!(
        original = %source.display(),
        replacement = %written.path.display(),
        kept = decision.to_keep.len(),
        dropped = decision.to_drop.len(),
        "archive repacked"
    );
    Ok(written)
}

/// Remove a container that no longer holds anything the index points at.
pub fn retire(path: &Path) -> Result<()> {
    if !remove_file_synced(path)? {
        debug!(archive = %path.display(), "archive already gone");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_domain::{Collector, ContentHash, NoProgress, RepackOutcome};
    use tempfile::tempdir;

    #[test]
    fn repack_keeps_exactly_the_kept_entries() -> Result<()> {
        let temp = tempdir()?;
        let store = FileStore::open(temp.path().join("store"))?;
        let mut builder = ArchiveBuilder::new();
        for payload in [&b"keep one"[..], b"drop one", b"keep two"] {
            builder.push_content(payload)?;
        }
        let original = builder.finish(&store.tmp_dir(), &store.archives_dir())?;

        let mut collector = Collector::new();
        collector.register_archive(original.path.clone(), original.header.clone())?;
        collector.mark_referenced(ContentHash::of(b"keep one"));
        collector.mark_referenced(ContentHash::of(b"keep two"));

        let mut written = None;
        collector.collect(&NoProgress, |slice, decision, archive| {
            let replacement = repack_archive(&store, archive, decision, slice)
                .map_err(stash_domain::RepackError::recoverable)?;
            let location = replacement.path.clone();
            written = Some(replacement);
            Ok(RepackOutcome::Replaced { location })
        })?;
        let written = written.expect("one archive repacked");

        assert!(original.path.exists(), "repack never deletes the original");
        let parsed = archive::parse_header(&written.path)?;
        let hashes: Vec<_> = parsed.entries.iter().map(|entry| entry.hash).collect();
        assert_eq!(
            hashes,
            vec![ContentHash::of(b"keep one"), ContentHash::of(b"keep two")]
        );
        for (entry, expected) in parsed.entries.iter().zip([&b"keep one"[..], b"keep two"]) {
            let source = original.header.entry(&entry.hash).expect("source entry");
            assert_eq!(entry.size, source.size);
            assert_eq!(
                archive::read_block(&written.path, &parsed, entry)?,
                archive::read_block(&original.path, &original.header, source)?,
                "blocks are copied without recompression"
            );
            assert_eq!(archive::read_entry(&written.path, &parsed, entry)?, expected);
        }

        retire(&original.path)?;
        assert!(!original.path.exists());
        retire(&original.path)?;
        Ok(())
    }
}
