// src/kernel/mm/swap.rs
//! Swap store
//!
//! A single block device carved into page-sized slots of
//! `SECTORS_PER_PAGE` contiguous sectors. Slot occupancy is tracked by a
//! sector bitmap (first-fit from sector 0); the mapping from SPT entry
//! to its slot lives in the swap map.
//!
//! SWAP_LOCK guards the map, BITMAP_LOCK the bitmap; they are acquired
//! in that order.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::constants::{SECTOR_SIZE, SECTORS_PER_PAGE};
use crate::errors::unified::SwapError;
use crate::kernel::core::traits::BlockDevice;

use super::spt::SptId;
use super::types::SectorIndex;

/// Occupancy of the swap device's sectors
pub struct SectorBitmap {
    bits: Vec<bool>,
}

impl SectorBitmap {
    /// Bitmap over `sectors` sectors, all free
    pub fn new(sectors: usize) -> Self {
        Self {
            bits: alloc::vec![false; sectors],
        }
    }

    /// Find the first run of `run` clear bits starting the search at
    /// index 0, set them, and return the run's start.
    pub fn scan_and_set(&mut self, run: usize) -> Option<usize> {
        if run == 0 || run > self.bits.len() {
            return None;
        }
        let mut start = 0;
        while start + run <= self.bits.len() {
            match self.bits[start..start + run].iter().rposition(|b| *b) {
                // Skip past the last set bit in the window.
                Some(set) => start += set + 1,
                None => {
                    self.bits[start..start + run].fill(true);
                    return Some(start);
                }
            }
        }
        None
    }

    /// Clear `run` bits starting at `start`
    pub fn clear_run(&mut self, start: usize, run: usize) {
        debug_assert!(start + run <= self.bits.len());
        self.bits[start..start + run].fill(false);
    }

    /// Number of occupied sectors
    pub fn set_count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}

/// Mapping from swapped-out SPT entries to their slot's first sector
pub struct SwapMap {
    slots: BTreeMap<SptId, SectorIndex>,
}

impl SwapMap {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// Number of pages currently swapped out
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether `id` has a slot
    pub fn contains(&self, id: SptId) -> bool {
        self.slots.contains_key(&id)
    }
}

impl Default for SwapMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one page of memory out to a fresh swap slot for `id`.
///
/// Finds a contiguous slot first-fit, marks it occupied, writes the
/// page's sectors in order and records the slot in the map. Fails only
/// if no slot is available.
pub fn write_out<D: BlockDevice>(
    map: &mut SwapMap,
    bitmap: &mut SectorBitmap,
    device: &D,
    id: SptId,
    page: &[u8],
) -> Result<(), SwapError> {
    debug_assert_eq!(page.len(), SECTOR_SIZE * SECTORS_PER_PAGE);
    debug_assert!(!map.slots.contains_key(&id));

    let start = bitmap
        .scan_and_set(SECTORS_PER_PAGE)
        .ok_or(SwapError::OutOfSlots)?;

    for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
        device.write_sector(SectorIndex::new(start + i), sector);
    }
    map.slots.insert(id, SectorIndex::new(start));
    log::trace!("[Swap] wrote {:?} to sectors {}..{}", id, start, start + SECTORS_PER_PAGE);
    Ok(())
}

/// Read the page stored for `id` back into `page`, then release the
/// slot and drop the map entry.
///
/// The caller must have checked the entry's `in_swap` flag; a missing
/// map entry is a precondition violation.
pub fn read_in<D: BlockDevice>(
    map: &mut SwapMap,
    bitmap: &mut SectorBitmap,
    device: &D,
    id: SptId,
    page: &mut [u8],
) -> Result<(), SwapError> {
    debug_assert_eq!(page.len(), SECTOR_SIZE * SECTORS_PER_PAGE);

    let start = map.slots.remove(&id).ok_or(SwapError::MissingEntry)?;
    for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
        device.read_sector(start.advance(i), sector);
    }
    bitmap.clear_run(start.as_usize(), SECTORS_PER_PAGE);
    log::trace!("[Swap] read {:?} back from {}", id, start);
    Ok(())
}

/// Release the slot held for `id` without reading it (process teardown
/// of a swapped-out page). Returns whether a slot was held.
pub fn release_slot(map: &mut SwapMap, bitmap: &mut SectorBitmap, id: SptId) -> bool {
    match map.slots.remove(&id) {
        Some(start) => {
            bitmap.clear_run(start.as_usize(), SECTORS_PER_PAGE);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::kernel::mm::spt::{PageSource, SptArena, SptEntry};
    use crate::kernel::mm::types::{Pid, UserPage, VirtAddr};
    use core::cell::RefCell;

    /// In-memory sector store
    struct TestDevice {
        sectors: RefCell<Vec<u8>>,
    }

    impl TestDevice {
        fn new(sectors: usize) -> Self {
            Self {
                sectors: RefCell::new(alloc::vec![0; sectors * SECTOR_SIZE]),
            }
        }
    }

    impl BlockDevice for TestDevice {
        fn sector_count(&self) -> usize {
            self.sectors.borrow().len() / SECTOR_SIZE
        }

        fn read_sector(&self, sector: SectorIndex, buf: &mut [u8]) {
            let at = sector.as_usize() * SECTOR_SIZE;
            buf.copy_from_slice(&self.sectors.borrow()[at..at + SECTOR_SIZE]);
        }

        fn write_sector(&self, sector: SectorIndex, buf: &[u8]) {
            let at = sector.as_usize() * SECTOR_SIZE;
            self.sectors.borrow_mut()[at..at + SECTOR_SIZE].copy_from_slice(buf);
        }
    }

    fn make_id(arena: &mut SptArena<()>, n: u32) -> SptId {
        arena.insert(SptEntry {
            page: UserPage::containing(VirtAddr::new(n * 0x1000)),
            owner: Pid::new(1),
            source: PageSource::Stack,
            writable: true,
            in_swap: false,
            frame: None,
        })
    }

    #[test]
    fn test_first_fit_from_zero() {
        let mut bitmap = SectorBitmap::new(32);
        assert_eq!(bitmap.scan_and_set(8), Some(0));
        assert_eq!(bitmap.scan_and_set(8), Some(8));

        // Freeing the first slot makes it the next first fit again.
        bitmap.clear_run(0, 8);
        assert_eq!(bitmap.scan_and_set(8), Some(0));
        assert_eq!(bitmap.scan_and_set(8), Some(16));
        assert_eq!(bitmap.scan_and_set(8), Some(24));
        assert_eq!(bitmap.scan_and_set(8), None);
    }

    #[test]
    fn test_scan_skips_partial_runs() {
        let mut bitmap = SectorBitmap::new(24);
        // Occupy sector 5 so the first 8-run must start at 6.
        assert_eq!(bitmap.scan_and_set(1), Some(0));
        bitmap.clear_run(0, 1);
        bitmap.bits[5] = true;
        assert_eq!(bitmap.scan_and_set(8), Some(6));
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let device = TestDevice::new(64);
        let mut map = SwapMap::new();
        let mut bitmap = SectorBitmap::new(64);
        let mut arena: SptArena<()> = SptArena::new();
        let id = make_id(&mut arena, 1);

        let mut page = alloc::vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        write_out(&mut map, &mut bitmap, &device, id, &page).unwrap();
        assert!(map.contains(id));
        assert_eq!(bitmap.set_count(), SECTORS_PER_PAGE);

        let mut restored = alloc::vec![0u8; PAGE_SIZE];
        read_in(&mut map, &mut bitmap, &device, id, &mut restored).unwrap();
        assert_eq!(restored, page);

        // Retrieval frees the slot and the map entry.
        assert!(!map.contains(id));
        assert_eq!(bitmap.set_count(), 0);
    }

    #[test]
    fn test_exhaustion_reports_out_of_slots() {
        let device = TestDevice::new(SECTORS_PER_PAGE);
        let mut map = SwapMap::new();
        let mut bitmap = SectorBitmap::new(SECTORS_PER_PAGE);
        let mut arena: SptArena<()> = SptArena::new();
        let page = alloc::vec![0u8; PAGE_SIZE];

        let first = make_id(&mut arena, 1);
        write_out(&mut map, &mut bitmap, &device, first, &page).unwrap();

        let second = make_id(&mut arena, 2);
        let result = write_out(&mut map, &mut bitmap, &device, second, &page);
        assert_eq!(result, Err(SwapError::OutOfSlots));
    }

    #[test]
    fn test_read_in_without_entry_is_reported() {
        let device = TestDevice::new(8);
        let mut map = SwapMap::new();
        let mut bitmap = SectorBitmap::new(8);
        let mut arena: SptArena<()> = SptArena::new();
        let id = make_id(&mut arena, 1);

        let mut page = alloc::vec![0u8; PAGE_SIZE];
        let result = read_in(&mut map, &mut bitmap, &device, id, &mut page);
        assert_eq!(result, Err(SwapError::MissingEntry));
    }

    #[test]
    fn test_release_slot_on_teardown() {
        let device = TestDevice::new(16);
        let mut map = SwapMap::new();
        let mut bitmap = SectorBitmap::new(16);
        let mut arena: SptArena<()> = SptArena::new();
        let id = make_id(&mut arena, 1);
        let page = alloc::vec![0u8; PAGE_SIZE];

        write_out(&mut map, &mut bitmap, &device, id, &page).unwrap();
        assert!(release_slot(&mut map, &mut bitmap, id));
        assert_eq!(bitmap.set_count(), 0);
        assert!(!release_slot(&mut map, &mut bitmap, id));
    }
}
