// src/kernel/mm/frame.rs
//! Frame table and clock eviction
//!
//! Owns every physical frame handed out to user pages. Frames sit in an
//! ordered list scanned by a clock hand; the second-chance `r` bit and
//! the hardware accessed bits decide who gets evicted when the pool runs
//! dry.
//!
//! Everything here runs with FRAME_LOCK and SHARE_LOCK held (see
//! `VmContext::lock_tables`). Eviction additionally takes the swap and
//! bitmap locks, and writes memory-mapped pages back to their file, so
//! callers carry the filesystem session through.

use alloc::vec::Vec;

use crate::errors::unified::FaultError;
use crate::kernel::core::traits::{FileHandle, FramePool, PageDirectory, Platform, UserFrame};
use crate::kernel::mm::{FsSession, VmContext, VmState};

use super::mmap;
use super::share::{ShareKey, ShareTable};
use super::spt::{PageSource, SptId};
use super::swap;

/// Stable handle to a frame-table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    #[cfg(test)]
    pub(crate) const fn for_tests(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// One user frame owned by the table
pub struct FrameEntry<Fr> {
    /// The physical frame itself; its kernel page pointer is the frame's
    /// identity
    pub storage: Fr,
    /// SPT entry that first allocated the frame
    pub creator: SptId,
    /// `(inode, offset)` keying the share table, for shareable frames
    pub share_key: Option<ShareKey>,
    /// Read-only and file-backed, so eligible for deduplication
    pub shareable: bool,
    /// Clock reference bit
    pub r_bit: bool,
}

struct FrameSlot<Fr> {
    generation: u32,
    entry: Option<FrameEntry<Fr>>,
}

/// The global frame table: slots plus the clock order
pub struct FrameTable<Fr> {
    slots: Vec<FrameSlot<Fr>>,
    free: Vec<u32>,
    /// Clock order; new frames join at the tail
    order: Vec<FrameId>,
    /// Clock hand, an index into `order`
    hand: usize,
}

impl<Fr> FrameTable<Fr> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            hand: 0,
        }
    }

    /// Number of frames currently owned
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Store a frame, appending it to the clock order
    pub fn insert(&mut self, entry: FrameEntry<Fr>) -> FrameId {
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            FrameId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(FrameSlot {
                generation: 0,
                entry: Some(entry),
            });
            FrameId {
                index,
                generation: 0,
            }
        };
        self.order.push(id);
        id
    }

    pub fn get(&self, id: FrameId) -> Option<&FrameEntry<Fr>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameEntry<Fr>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// The frame the clock hand points at
    pub fn at_hand(&self) -> Option<FrameId> {
        self.order.get(self.hand).copied()
    }

    /// Advance the hand circularly
    pub fn advance_hand(&mut self) {
        if !self.order.is_empty() {
            self.hand = (self.hand + 1) % self.order.len();
        }
    }

    /// Remove a frame from the table and the clock order.
    ///
    /// If the hand referred to this frame it moves to the previous
    /// element first, so the next advance lands on the removed frame's
    /// successor.
    pub fn remove(&mut self, id: FrameId) -> Option<FrameEntry<Fr>> {
        let pos = self.order.iter().position(|f| *f == id)?;
        if pos == self.hand {
            self.hand = if self.hand == 0 {
                self.order.len() - 1
            } else {
                self.hand - 1
            };
        }
        self.order.remove(pos);
        if self.order.is_empty() {
            self.hand = 0;
        } else if pos < self.hand {
            self.hand -= 1;
        }

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

impl<Fr> Default for FrameTable<Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// Obtain a user frame for `creator`, evicting if the pool is dry.
///
/// The new frame joins the clock order at the tail with `r = false`;
/// `shareable` and the share key are derived from the creator entry.
pub(crate) fn allocate_frame<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    creator: SptId,
    zeroed: bool,
    fs: &FsSession<'_>,
) -> Result<FrameId, FaultError> {
    let storage = match ctx.pool().allocate(zeroed) {
        Some(storage) => storage,
        None => {
            evict(ctx, state, share, fs)?;
            // Eviction freed at least one frame, so the retry succeeds
            // unless the pool is shared with a collaborator that raced
            // us; report exhaustion in that case.
            ctx.pool()
                .allocate(zeroed)
                .ok_or(FaultError::OutOfFrames)?
        }
    };

    let entry = state.spt.get(creator).ok_or(FaultError::NoSuchMapping)?;
    let shareable = !entry.writable && matches!(entry.source, PageSource::File { .. });
    let share_key = match (&entry.source, shareable) {
        (PageSource::File { file, ofs, .. }, true) => Some((file.inode(), *ofs)),
        _ => None,
    };

    Ok(state.frames.insert(FrameEntry {
        storage,
        creator,
        share_key,
        shareable,
        r_bit: false,
    }))
}

/// Release the frame referenced by `id`'s SPT entry, if any.
///
/// Shareable frames only leave the table when the last alias goes away;
/// either way the owner's page-directory mapping for the entry's page is
/// cleared before the frame is returned to the pool.
pub(crate) fn free_from_spt<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    id: SptId,
) {
    let Some(entry) = state.spt.get(id) else {
        return;
    };
    let Some(fid) = entry.frame else {
        return;
    };
    let page = entry.page;
    let owner = entry.owner;

    if let Some(proc_vm) = state.procs.get(&owner) {
        proc_vm.pd.clear(page);
    }
    if let Some(entry) = state.spt.get_mut(id) {
        entry.frame = None;
    }

    let (shareable, share_key) = match state.frames.get(fid) {
        Some(frame) => (frame.shareable, frame.share_key),
        None => return,
    };

    if shareable {
        if let Some(key) = share_key {
            match share.remove_alias(key, id) {
                Some(0) => {
                    share.remove(key);
                }
                Some(_) => return, // other aliases keep the frame alive
                None => {}         // never entered the share table
            }
        }
    }

    if let Some(frame) = state.frames.remove(fid) {
        ctx.pool().release(frame.storage);
    }
}

/// Drop a frame that was allocated but never linked to its SPT entry
/// (load rollback).
pub(crate) fn discard_frame<P: Platform>(ctx: &VmContext<P>, state: &mut VmState<P>, fid: FrameId) {
    if let Some(frame) = state.frames.remove(fid) {
        ctx.pool().release(frame.storage);
    }
}

/// Clock replacement: free exactly one frame.
///
/// Walks the clock order honoring hardware accessed bits on the first
/// lap and the `r` bits afterwards. Shared frames aggregate the
/// accessed bits of every alias. Termination is bounded by two laps
/// plus one visit.
pub(crate) fn evict<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    fs: &FsSession<'_>,
) -> Result<(), FaultError> {
    let len = state.frames.len();
    if len == 0 {
        return Err(FaultError::OutOfFrames);
    }

    // After one full lap every accessed bit has been read and cleared;
    // from then on only the r bits decide.
    let mut first_lap = true;
    let mut visits = 0usize;

    loop {
        if visits > 2 * len + 1 {
            return Err(FaultError::OutOfFrames);
        }
        visits += 1;
        if visits > len {
            first_lap = false;
        }

        let fid = match state.frames.at_hand() {
            Some(fid) => fid,
            None => return Err(FaultError::OutOfFrames),
        };
        let (shareable, share_key, creator, r_bit) = {
            let frame = state.frames.get(fid).ok_or(FaultError::OutOfFrames)?;
            (frame.shareable, frame.share_key, frame.creator, frame.r_bit)
        };

        let shared = share_key.filter(|_| shareable).and_then(|key| {
            share.find(key).map(|entry| (key, entry.aliases.clone()))
        });

        if let Some((key, aliases)) = shared {
            // Aggregate accessed over every (owner pd, aliased page),
            // clearing each bit as it is read.
            let mut accessed = false;
            for alias in &aliases {
                if let Some(spt) = state.spt.get(*alias) {
                    if let Some(proc_vm) = state.procs.get(&spt.owner) {
                        if proc_vm.pd.is_accessed(spt.page) {
                            accessed = true;
                        }
                        proc_vm.pd.set_accessed(spt.page, false);
                    }
                }
            }

            if accessed && first_lap {
                if let Some(frame) = state.frames.get_mut(fid) {
                    frame.r_bit = true;
                }
                state.frames.advance_hand();
                continue;
            }
            if r_bit {
                if let Some(frame) = state.frames.get_mut(fid) {
                    frame.r_bit = false;
                }
                state.frames.advance_hand();
                continue;
            }

            // Evict the shared frame: unmap every alias, drop the share
            // entry, free the frame.
            for alias in &aliases {
                if let Some(spt) = state.spt.get(*alias) {
                    let (owner, page) = (spt.owner, spt.page);
                    if let Some(proc_vm) = state.procs.get(&owner) {
                        proc_vm.pd.clear(page);
                    }
                }
                if let Some(spt) = state.spt.get_mut(*alias) {
                    spt.frame = None;
                }
            }
            share.remove(key);
            if let Some(frame) = state.frames.remove(fid) {
                ctx.pool().release(frame.storage);
            }
            state.frames.advance_hand();
            log::debug!("[Frame] evicted shared frame with {} aliases", aliases.len());
            return Ok(());
        }

        // Single-owner branch.
        let (owner, page) = match state.spt.get(creator) {
            Some(spt) => (spt.owner, spt.page),
            None => {
                // Creator vanished without freeing its frame; reclaim it.
                if let Some(frame) = state.frames.remove(fid) {
                    ctx.pool().release(frame.storage);
                }
                state.frames.advance_hand();
                return Ok(());
            }
        };

        let accessed = match state.procs.get(&owner) {
            Some(proc_vm) => {
                let was = proc_vm.pd.is_accessed(page);
                proc_vm.pd.set_accessed(page, false);
                was
            }
            None => false,
        };

        if accessed && first_lap {
            if let Some(frame) = state.frames.get_mut(fid) {
                frame.r_bit = true;
            }
            state.frames.advance_hand();
            continue;
        }
        if r_bit {
            if let Some(frame) = state.frames.get_mut(fid) {
                frame.r_bit = false;
            }
            state.frames.advance_hand();
            continue;
        }

        evict_single(ctx, state, fid, creator, fs)?;
        state.frames.advance_hand();
        return Ok(());
    }
}

/// Evict a non-shared frame: write memory-mapped pages back to their
/// file, push anonymous and dirty pages to swap, and free the frame.
fn evict_single<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    fid: FrameId,
    creator: SptId,
    _fs: &FsSession<'_>,
) -> Result<(), FaultError> {
    let (owner, page) = match state.spt.get(creator) {
        Some(spt) => (spt.owner, spt.page),
        None => return Err(FaultError::NoSuchMapping),
    };
    let dirty = state
        .procs
        .get(&owner)
        .map(|proc_vm| proc_vm.pd.is_dirty(page))
        .unwrap_or(false);

    enum Plan<F> {
        Mmap {
            file: F,
            ofs: crate::kernel::mm::types::FileOfs,
            read_bytes: u32,
            mapid: crate::kernel::mm::types::Mapid,
        },
        Anon {
            is_stack: bool,
        },
    }

    let plan = {
        let entry = state.spt.get(creator).ok_or(FaultError::NoSuchMapping)?;
        match &entry.source {
            PageSource::Mmap {
                file,
                ofs,
                read_bytes,
                mapid,
                ..
            } => Plan::Mmap {
                file: file.clone(),
                ofs: *ofs,
                read_bytes: *read_bytes,
                mapid: *mapid,
            },
            PageSource::Stack => Plan::Anon { is_stack: true },
            PageSource::File { .. } => Plan::Anon { is_stack: false },
        }
    };

    match plan {
        Plan::Mmap {
            file,
            ofs,
            read_bytes,
            mapid,
        } => {
            if dirty {
                let frame = state.frames.get(fid).ok_or(FaultError::NoSuchMapping)?;
                let written =
                    file.write_at(&frame.storage.contents()[..read_bytes as usize], ofs);
                if written != read_bytes as usize {
                    log::warn!("[Frame] short write-back of mmap page at {}", page);
                }
            }
            if let Some(proc_vm) = state.procs.get(&owner) {
                proc_vm.pd.clear(page);
            }
            // The page leaves the mapping: drop the SPT entry and its
            // slot in the mapping record.
            state.spt.remove(creator);
            if let Some(proc_vm) = state.procs.get_mut(&owner) {
                proc_vm.pages.remove(page);
                mmap::forget_page(&mut proc_vm.mmaps, mapid, creator);
            }
            if let Some(frame) = state.frames.remove(fid) {
                ctx.pool().release(frame.storage);
            }
            log::debug!("[Frame] evicted mmap page {} of {}", page, owner);
            Ok(())
        }
        Plan::Anon { is_stack } => {
            if is_stack || dirty {
                let (mut swap_map, mut sectors) = ctx.lock_swap();
                let frame = state.frames.get(fid).ok_or(FaultError::NoSuchMapping)?;
                swap::write_out(
                    &mut swap_map,
                    &mut sectors,
                    ctx.device(),
                    creator,
                    frame.storage.contents(),
                )?;
                // The swap write has completed; only now may the entry
                // claim its contents live in swap.
                if let Some(entry) = state.spt.get_mut(creator) {
                    entry.in_swap = true;
                }
            }
            if let Some(proc_vm) = state.procs.get(&owner) {
                proc_vm.pd.clear(page);
            }
            if let Some(entry) = state.spt.get_mut(creator) {
                entry.frame = None;
            }
            if let Some(frame) = state.frames.remove(fid) {
                ctx.pool().release(frame.storage);
            }
            log::debug!(
                "[Frame] evicted page {} of {} ({})",
                page,
                owner,
                if is_stack || dirty { "to swap" } else { "dropped" }
            );
            Ok(())
        }
    }
}
