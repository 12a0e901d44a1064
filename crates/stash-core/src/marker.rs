use anyhow::Result;
use stash_domain::{Collector, HeaderView};
use tracing::debug;

use crate::store::FileStore;

/// Mark every hash referenced by a live owner. Loadouts and game backups are
/// both roots; retired owners are not.
pub fn mark_live_hashes<H: HeaderView>(
    store: &FileStore,
    collector: &mut Collector<H>,
) -> Result<usize> {
    let live = store.live_hashes()?;
    let mut marked = 0;
    for hash in live {
        if collector.mark_referenced(hash) {
            marked += 1;
        }
    }
    debug!(marked, "live hashes marked");
    Ok(marked)
}
