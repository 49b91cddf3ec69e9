// src/kernel/mm/mmap.rs
//! Memory-mapped files
//!
//! Each process keeps a list of mapping records; a record associates a
//! process-local `mapid` with the SPT entries covering the mapped
//! region. `mmap` re-opens the file so the mapping survives the caller
//! closing its descriptor; `munmap` writes dirty pages back and removes
//! the region.

use alloc::vec::Vec;

use crate::constants::PAGE_SIZE;
use crate::errors::unified::MmapError;
use crate::kernel::core::traits::{FileHandle, PageDirectory, Platform, UserFrame};
use crate::kernel::mm::{FsAccess, FsSession, VmContext, VmState};

use super::frame;
use super::share::ShareTable;
use super::spt::{self, PageSource, SptId};
use super::types::{FileOfs, Mapid, Pid, UserPage, VirtAddr};

/// One mapped region of one process
pub struct MappedFile {
    /// Process-local handle for the mapping
    pub mapid: Mapid,
    /// SPT entries covering the region, in address order
    pub entries: Vec<SptId>,
}

/// Per-process list of mapping records
pub struct MmapRegistry {
    records: Vec<MappedFile>,
}

impl MmapRegistry {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record
    pub fn find(&self, mapid: Mapid) -> Option<&MappedFile> {
        self.records.iter().find(|r| r.mapid == mapid)
    }

    /// Register a record
    pub fn push(&mut self, record: MappedFile) {
        self.records.push(record);
    }

    /// Remove and return a record
    pub fn remove(&mut self, mapid: Mapid) -> Option<MappedFile> {
        let pos = self.records.iter().position(|r| r.mapid == mapid)?;
        Some(self.records.remove(pos))
    }

    /// Mapids of every record, for teardown
    pub fn mapids(&self) -> Vec<Mapid> {
        self.records.iter().map(|r| r.mapid).collect()
    }
}

impl Default for MmapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop `id` from the record of `mapid` after the evictor destroyed the
/// page; the record itself goes away when its last page does.
pub(crate) fn forget_page(registry: &mut MmapRegistry, mapid: Mapid, id: SptId) {
    if let Some(pos) = registry.records.iter().position(|r| r.mapid == mapid) {
        let record = &mut registry.records[pos];
        record.entries.retain(|e| *e != id);
        if record.entries.is_empty() {
            registry.records.remove(pos);
        }
    }
}

/// Map the file open as `fd` at `addr`.
///
/// Fails without side effects when the descriptor is a console
/// descriptor, the address is NULL, misaligned or not in user space,
/// the file is empty, or any covered page already has an SPT entry.
/// On success returns a fresh, per-process monotonically increasing
/// mapid.
pub fn mmap<P: Platform>(
    ctx: &VmContext<P>,
    pid: Pid,
    fd: i32,
    file: &P::File,
    addr: VirtAddr,
    fs: FsAccess<'_, '_>,
) -> Result<Mapid, MmapError> {
    if fd == 0 || fd == 1 {
        return Err(MmapError::BadDescriptor);
    }
    if addr.is_null() {
        return Err(MmapError::NullAddress);
    }
    if !addr.is_page_aligned() {
        return Err(MmapError::Misaligned);
    }
    if !addr.is_user() {
        return Err(MmapError::KernelAddress);
    }

    let _session = ctx.fs_session(fs);

    // An independent handle, so the mapping survives close(fd).
    let handle = file.reopen().ok_or(MmapError::ReopenFailed)?;
    let length = handle.length();
    if length == 0 {
        return Err(MmapError::EmptyFile);
    }

    let mut tables = ctx.lock_tables();
    let (state, _share) = tables.parts();

    let page_count = (length as usize).div_ceil(PAGE_SIZE);

    // Validate the whole region before creating anything, so failure
    // leaves no partial mapping behind.
    {
        let proc_vm = state.procs.get(&pid).ok_or(MmapError::UnknownProcess)?;
        let mut page = UserPage::from_aligned(addr).ok_or(MmapError::Misaligned)?;
        for i in 0..page_count {
            if !page.is_user() {
                return Err(MmapError::KernelAddress);
            }
            if proc_vm.pages.lookup_page(page).is_some() {
                return Err(MmapError::AlreadyMapped);
            }
            if i + 1 < page_count {
                page = page.next().ok_or(MmapError::KernelAddress)?;
            }
        }
    }

    let proc_vm = state.procs.get_mut(&pid).ok_or(MmapError::UnknownProcess)?;
    let mapid = proc_vm.take_mapid();

    let mut entries = Vec::with_capacity(page_count);
    let mut page = UserPage::from_aligned(addr).ok_or(MmapError::Misaligned)?;
    let mut remaining = length;
    for i in 0..page_count {
        let read_bytes = remaining.min(PAGE_SIZE as u32);
        let zero_bytes = PAGE_SIZE as u32 - read_bytes;
        let ofs = FileOfs::new(i as u32 * PAGE_SIZE as u32);

        // Cannot collide: the region was validated above under the same
        // tables guard.
        let id = spt::create_mmap_page(
            &mut state.spt,
            &mut proc_vm.pages,
            pid,
            handle.clone(),
            ofs,
            page,
            read_bytes,
            zero_bytes,
            mapid,
        )
        .ok_or(MmapError::AlreadyMapped)?;
        entries.push(id);

        remaining -= read_bytes;
        if i + 1 < page_count {
            page = page.next().ok_or(MmapError::KernelAddress)?;
        }
    }

    proc_vm.mmaps.push(MappedFile { mapid, entries });
    log::debug!(
        "[Mmap] {} mapped {} bytes at {} as {}",
        pid,
        length,
        addr,
        mapid
    );
    Ok(mapid)
}

/// Unmap `mapid`: write dirty resident pages back to the file, free
/// their frames, and destroy the region's SPT entries.
///
/// A negative or unknown mapid is silently ignored.
pub fn munmap<P: Platform>(ctx: &VmContext<P>, pid: Pid, mapid: Mapid, fs: FsAccess<'_, '_>) {
    if mapid.as_i32() < 0 {
        return;
    }
    let session = ctx.fs_session(fs);
    let mut tables = ctx.lock_tables();
    let (state, share) = tables.parts();
    munmap_locked(ctx, state, share, pid, mapid, &session);
}

/// `munmap` body, for callers that already hold the tables (process
/// teardown).
pub(crate) fn munmap_locked<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    pid: Pid,
    mapid: Mapid,
    _fs: &FsSession<'_>,
) {
    let Some(record) = state
        .procs
        .get_mut(&pid)
        .and_then(|proc_vm| proc_vm.mmaps.remove(mapid))
    else {
        return;
    };

    for id in record.entries {
        write_back_if_dirty(state, id);
        frame::free_from_spt(ctx, state, share, id);
        if let Some(entry) = state.spt.remove(id) {
            if let Some(proc_vm) = state.procs.get_mut(&entry.owner) {
                proc_vm.pages.remove(entry.page);
            }
        }
    }
    log::debug!("[Mmap] {} unmapped {}", pid, mapid);
}

/// Flush one resident, dirty mmap page back to its file region.
fn write_back_if_dirty<P: Platform>(state: &VmState<P>, id: SptId) {
    let Some(entry) = state.spt.get(id) else {
        return;
    };
    let Some(fid) = entry.frame else {
        return;
    };
    let PageSource::Mmap {
        file,
        ofs,
        read_bytes,
        ..
    } = &entry.source
    else {
        return;
    };

    let dirty = state
        .procs
        .get(&entry.owner)
        .map(|proc_vm| proc_vm.pd.is_dirty(entry.page))
        .unwrap_or(false);
    if !dirty {
        return;
    }

    if let Some(frame) = state.frames.get(fid) {
        let written = file.write_at(&frame.storage.contents()[..*read_bytes as usize], *ofs);
        if written != *read_bytes as usize {
            log::warn!("[Mmap] short write-back at {}", entry.page);
        }
    }
}
