//! Format-agnostic view over a parsed archive header.
//!
//! Parsing happens once, when an archive is discovered; these traits only
//! read metadata that is already in memory and never touch payload bytes.
//! Structural validity is the parser's responsibility.

use crate::hash::ContentHash;

/// One logical file stored inside an archive.
///
/// Implementors usually carry format-specific location data (offsets, block
/// indices); the collector never looks at it.
pub trait FileEntry {
    fn hash(&self) -> ContentHash;

    /// Decompressed size in bytes.
    fn size(&self) -> u64;
}

/// Parsed header state of one archive container.
pub trait HeaderView {
    type Entry: FileEntry;

    /// Entries in the order the container stores them.
    fn entries(&self) -> &[Self::Entry];
}

impl<H: HeaderView + ?Sized> HeaderView for &H {
    type Entry = H::Entry;

    fn entries(&self) -> &[Self::Entry] {
        (**self).entries()
    }
}
