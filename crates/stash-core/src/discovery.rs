//! Find and parse every container under a store's `archives/` directory.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveHeader, ARCHIVE_EXTENSION};
use crate::store::ARCHIVES_DIR;

#[derive(Clone, Debug)]
pub struct DiscoveredArchive {
    pub path: PathBuf,
    pub header: ArchiveHeader,
}

/// A container that could not be parsed and is left out of the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnreadableArchive {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct Discovery {
    /// Parsed containers sorted by path.
    pub archives: Vec<DiscoveredArchive>,
    pub unreadable: Vec<UnreadableArchive>,
}

/// Walk `<root>/archives` and parse every `.stash` header in parallel.
pub fn discover_archives(root: &Path) -> Result<Discovery> {
    let archives_root = root.join(ARCHIVES_DIR);
    let mut discovery = Discovery::default();
    if !archives_root.exists() {
        return Ok(discovery);
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(&archives_root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map_or_else(|| archives_root.clone(), Path::to_path_buf);
                warn!(path = %path.display(), %err, "skipping unreadable store entry");
                discovery.unreadable.push(UnreadableArchive {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(ARCHIVE_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let parsed: Vec<_> = paths
        .into_par_iter()
        .map(|path| {
            let header = archive::parse_header(&path);
            (path, header)
        })
        .collect();

    for (path, header) in parsed {
        match header {
            Ok(header) => discovery.archives.push(DiscoveredArchive { path, header }),
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(archive = %path.display(), %reason, "excluding unreadable archive");
                discovery.unreadable.push(UnreadableArchive { path, reason });
            }
        }
    }

    debug!(
        archives = discovery.archives.len(),
        unreadable = discovery.unreadable.len(),
        "archive discovery complete"
    );
    Ok(discovery)
}
