// src/kernel/mm/share.rs
//! Share table
//!
//! Global deduplication index for read-only file-backed frames. A frame
//! loaded from `(inode, offset)` with `writable == false` is entered
//! here so that other processes mapping the same executable page alias
//! the existing frame instead of loading a copy.
//!
//! Guarded by SHARE_LOCK, which is only ever taken together with (and
//! after) FRAME_LOCK.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::frame::FrameId;
use super::spt::SptId;
use super::types::{FileOfs, InodeId};

/// Identity of a shareable file region: (inode, offset)
pub type ShareKey = (InodeId, FileOfs);

/// One deduplicated read-only frame
pub struct ShareEntry {
    /// The shared frame
    pub frame: FrameId,
    /// SPT entries currently aliasing the frame (never empty while the
    /// entry exists)
    pub aliases: Vec<SptId>,
}

/// Global share table
pub struct ShareTable {
    entries: BTreeMap<ShareKey, ShareEntry>,
}

impl ShareTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of deduplicated frames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the entry for a file region, if any
    pub fn find(&self, key: ShareKey) -> Option<&ShareEntry> {
        self.entries.get(&key)
    }

    /// Create the entry for `key` with a singleton alias list.
    ///
    /// `key` must not be present yet.
    pub fn insert_new(&mut self, key: ShareKey, spt: SptId, frame: FrameId) {
        debug_assert!(!self.entries.contains_key(&key));
        self.entries.insert(
            key,
            ShareEntry {
                frame,
                aliases: alloc::vec![spt],
            },
        );
    }

    /// Append an SPT entry to the alias list of `key`
    pub fn add_alias(&mut self, key: ShareKey, spt: SptId) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.aliases.push(spt);
        }
    }

    /// Remove `spt` from the alias list of `key`.
    ///
    /// Returns the number of aliases remaining so the caller can decide
    /// whether to delete the entry and free the frame.
    pub fn remove_alias(&mut self, key: ShareKey, spt: SptId) -> Option<usize> {
        let entry = self.entries.get_mut(&key)?;
        entry.aliases.retain(|id| *id != spt);
        Some(entry.aliases.len())
    }

    /// Delete the entry for `key`, returning it
    pub fn remove(&mut self, key: ShareKey) -> Option<ShareEntry> {
        self.entries.remove(&key)
    }

    /// Number of aliases for `key` (0 when absent); for diagnostics
    pub fn alias_count(&self, key: ShareKey) -> usize {
        self.entries.get(&key).map_or(0, |e| e.aliases.len())
    }
}

impl Default for ShareTable {
    fn default() -> Self {
        Self::new()
    }
}
