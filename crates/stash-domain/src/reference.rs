use indexmap::IndexSet;

use crate::hash::ContentHash;

/// Hashes that are still reachable from live application state, in the
/// order they were marked.
///
/// Built fresh for every run by the marking pass and only read while
/// collecting.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    hashes: IndexSet<ContentHash>,
}

impl ReferenceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the hash was not marked before.
    pub fn insert(&mut self, hash: ContentHash) -> bool {
        self.hashes.insert(hash)
    }

    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentHash> {
        self.hashes.iter()
    }
}

impl Extend<ContentHash> for ReferenceSet {
    fn extend<T: IntoIterator<Item = ContentHash>>(&mut self, iter: T) {
        self.hashes.extend(iter);
    }
}

impl FromIterator<ContentHash> for ReferenceSet {
    fn from_iter<T: IntoIterator<Item = ContentHash>>(iter: T) -> Self {
        Self {
            hashes: iter.into_iter().collect(),
        }
    }
}
