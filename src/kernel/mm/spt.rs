// src/kernel/mm/spt.rs
//! Supplemental page table
//!
//! Per-process lazy-loading metadata for user pages: where the contents
//! of a page come from (file, stack, memory-mapped file), whether it is
//! currently resident, and whether it has been pushed out to swap.
//!
//! Entries live in a crate-wide arena of generational slots; the
//! [`SptId`] handles stay valid across unrelated insertions and removals
//! and are what the frame table, share table and swap map refer to.
//! Each process keeps its own page -> handle map ([`SuppPageTable`]).
//!
//! Residency fields (`frame`, `in_swap`) are only read or written with
//! the frame-table lock held; the evictor relies on that to manipulate
//! entries of other processes.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::constants::PAGE_SIZE;

use super::frame::FrameId;
use super::types::{FileOfs, Mapid, Pid, UserPage, VirtAddr};

/// Where a non-resident page's contents come from
pub enum PageSource<F> {
    /// Backed by a region of an executable or data file
    File {
        /// Backing file handle
        file: F,
        /// Offset of the region within the file
        ofs: FileOfs,
        /// Bytes to read from the file (<= PAGE_SIZE)
        read_bytes: u32,
        /// Bytes to zero after the read (read_bytes + zero_bytes == PAGE_SIZE)
        zero_bytes: u32,
    },
    /// Anonymous stack page, starts zero-filled
    Stack,
    /// Page of a memory-mapped file
    Mmap {
        /// Independent handle obtained by re-opening the mapped file
        file: F,
        /// Offset of the page within the file
        ofs: FileOfs,
        /// Bytes backed by the file (<= PAGE_SIZE)
        read_bytes: u32,
        /// Bytes past the end of the file, zero-filled
        zero_bytes: u32,
        /// Mapping this page belongs to
        mapid: Mapid,
    },
}

/// Discriminant of [`PageSource`], for dispatch and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    File,
    Stack,
    Mmap,
}

impl<F> PageSource<F> {
    /// The variant discriminant
    pub fn kind(&self) -> PageKind {
        match self {
            PageSource::File { .. } => PageKind::File,
            PageSource::Stack => PageKind::Stack,
            PageSource::Mmap { .. } => PageKind::Mmap,
        }
    }
}

/// One supplemental page table entry
pub struct SptEntry<F> {
    /// User virtual page this entry describes (key)
    pub page: UserPage,
    /// Owning process (the evictor uses this to reach the right page
    /// directory)
    pub owner: Pid,
    /// Content source
    pub source: PageSource<F>,
    /// Whether the page may be written
    pub writable: bool,
    /// Whether the contents currently live in a swap slot
    pub in_swap: bool,
    /// Resident frame, if any
    pub frame: Option<FrameId>,
}

impl<F> SptEntry<F> {
    /// True when the entry is resident in a frame
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}

/// Stable handle to an [`SptEntry`] in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SptId {
    index: u32,
    generation: u32,
}

struct SptSlot<F> {
    generation: u32,
    entry: Option<SptEntry<F>>,
}

/// Arena of all SPT entries, across processes
pub struct SptArena<F> {
    slots: Vec<SptSlot<F>>,
    free: Vec<u32>,
}

impl<F> SptArena<F> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `entry` and return its handle
    pub fn insert(&mut self, entry: SptEntry<F>) -> SptId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            SptId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(SptSlot {
                generation: 0,
                entry: Some(entry),
            });
            SptId {
                index,
                generation: 0,
            }
        }
    }

    /// Resolve a handle
    pub fn get(&self, id: SptId) -> Option<&SptEntry<F>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, id: SptId) -> Option<&mut SptEntry<F>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Remove the entry behind `id`; later lookups with the same handle
    /// fail because the slot's generation advances.
    pub fn remove(&mut self, id: SptId) -> Option<SptEntry<F>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }
}

impl<F> Default for SptArena<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process map from user page to arena handle
pub struct SuppPageTable {
    pages: BTreeMap<UserPage, SptId>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Number of pages tracked for this process
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Look up the entry covering `addr` (page-rounded)
    pub fn lookup(&self, addr: VirtAddr) -> Option<SptId> {
        self.lookup_page(UserPage::containing(addr))
    }

    /// Look up by page
    pub fn lookup_page(&self, page: UserPage) -> Option<SptId> {
        self.pages.get(&page).copied()
    }

    /// Register `id` under `page`; fails if the page is already present
    pub fn insert(&mut self, page: UserPage, id: SptId) -> Result<(), SptId> {
        match self.pages.get(&page) {
            Some(existing) => Err(*existing),
            None => {
                self.pages.insert(page, id);
                Ok(())
            }
        }
    }

    /// Drop the mapping for `page`
    pub fn remove(&mut self, page: UserPage) -> Option<SptId> {
        self.pages.remove(&page)
    }

    /// Handles of every tracked page, in address order
    pub fn ids(&self) -> impl Iterator<Item = SptId> + '_ {
        self.pages.values().copied()
    }

    /// Pages currently tracked, in address order
    pub fn pages(&self) -> impl Iterator<Item = UserPage> + '_ {
        self.pages.keys().copied()
    }
}

impl Default for SuppPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a non-resident FILE entry for the loader.
///
/// When an entry for `page` already exists (overlapping ELF segments),
/// the entries are merged instead: `writable` is OR-ed and `read_bytes`
/// widened to the maximum, with `zero_bytes` adjusted so the sum stays
/// `PAGE_SIZE`.
pub fn create_file_page<F>(
    arena: &mut SptArena<F>,
    table: &mut SuppPageTable,
    owner: Pid,
    file: F,
    ofs: FileOfs,
    page: UserPage,
    read_bytes: u32,
    zero_bytes: u32,
    writable: bool,
) -> SptId {
    debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE as u32);

    if let Some(id) = table.lookup_page(page) {
        let entry = arena.get_mut(id).filter(|e| e.owner == owner);
        if let Some(entry) = entry {
            entry.writable |= writable;
            if let PageSource::File {
                read_bytes: existing_read,
                zero_bytes: existing_zero,
                ..
            } = &mut entry.source
            {
                if read_bytes > *existing_read {
                    *existing_read = read_bytes;
                    *existing_zero = PAGE_SIZE as u32 - read_bytes;
                }
            }
            return id;
        }
    }

    let id = arena.insert(SptEntry {
        page,
        owner,
        source: PageSource::File {
            file,
            ofs,
            read_bytes,
            zero_bytes,
        },
        writable,
        in_swap: false,
        frame: None,
    });
    // Cannot collide: the lookup above found nothing.
    let _ = table.insert(page, id);
    id
}

/// Create a non-resident MMAP entry; fails if `page` is occupied.
pub fn create_mmap_page<F>(
    arena: &mut SptArena<F>,
    table: &mut SuppPageTable,
    owner: Pid,
    file: F,
    ofs: FileOfs,
    page: UserPage,
    read_bytes: u32,
    zero_bytes: u32,
    mapid: Mapid,
) -> Option<SptId> {
    debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE as u32);

    if table.lookup_page(page).is_some() {
        return None;
    }
    let id = arena.insert(SptEntry {
        page,
        owner,
        source: PageSource::Mmap {
            file,
            ofs,
            read_bytes,
            zero_bytes,
            mapid,
        },
        writable: true,
        in_swap: false,
        frame: None,
    });
    let _ = table.insert(page, id);
    Some(id)
}

/// Create a non-resident, writable STACK entry; fails if `page` is
/// occupied.
pub fn create_stack_page<F>(
    arena: &mut SptArena<F>,
    table: &mut SuppPageTable,
    owner: Pid,
    page: UserPage,
) -> Option<SptId> {
    if table.lookup_page(page).is_some() {
        return None;
    }
    let id = arena.insert(SptEntry {
        page,
        owner,
        source: PageSource::Stack,
        writable: true,
        in_swap: false,
        frame: None,
    });
    let _ = table.insert(page, id);
    Some(id)
}
