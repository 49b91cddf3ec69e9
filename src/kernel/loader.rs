// src/kernel/loader.rs
//! Loader adapter
//!
//! Populates a process's supplemental page table from the PT_LOAD
//! segments of its executable - no eager I/O, every page is read on
//! first fault. Also establishes the minimal stack (one page just
//! below `PHYS_BASE`, faulted in immediately) and takes the deny-write
//! reference that protects the executable while it runs.
//!
//! ELF parsing itself is the embedder's job; this adapter consumes the
//! already-decoded program headers as [`Segment`]s.

use crate::constants::{PAGE_SIZE, PHYS_BASE};
use crate::errors::unified::LoadError;
use crate::kernel::core::traits::{FileHandle, Platform};
use crate::kernel::mm::page_fault;
use crate::kernel::mm::spt;
use crate::kernel::mm::types::{FileOfs, Pid, UserPage, VirtAddr};
use crate::kernel::mm::{FsAccess, VmContext};

/// One PT_LOAD segment of the executable
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Offset of the segment within the file
    pub offset: u32,
    /// Virtual address of the segment's first byte
    pub vaddr: VirtAddr,
    /// Bytes backed by the file
    pub file_size: u32,
    /// Bytes occupied in memory (>= `file_size`; the rest is zeroed)
    pub mem_size: u32,
    /// Whether the segment is mapped writable (PF_W)
    pub writable: bool,
}

/// Result of populating a process image
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Initial user stack pointer
    pub stack_pointer: VirtAddr,
    /// Number of pages registered for the segments
    pub segment_pages: usize,
}

/// Round `value` up to the next page boundary.
fn round_up_to_page(value: u32) -> u32 {
    value.div_ceil(PAGE_SIZE as u32) * PAGE_SIZE as u32
}

/// The checks `load()` performs on every program header before
/// trusting it.
fn validate_segment<F: FileHandle>(segment: &Segment, file: &F) -> bool {
    let page_mask = PAGE_SIZE as u32 - 1;

    // Offset and vaddr must share their page offset.
    if segment.offset & page_mask != segment.vaddr.as_u32() & page_mask {
        return false;
    }
    // The offset must point within the file.
    if segment.offset > file.length() {
        return false;
    }
    // The memory image cannot be smaller than the file image, and the
    // segment must not be empty.
    if segment.mem_size < segment.file_size || segment.mem_size == 0 {
        return false;
    }
    // The region must start and end in user space and must not wrap.
    let Some(end) = segment.vaddr.as_u32().checked_add(segment.mem_size) else {
        return false;
    };
    if !segment.vaddr.is_user() || end >= PHYS_BASE {
        return false;
    }
    // Mapping page 0 would let null-pointer bugs through.
    if segment.vaddr.as_u32() < PAGE_SIZE as u32 {
        return false;
    }
    true
}

/// Populate `pid`'s supplemental page table for `segments` of `file`.
///
/// Pages shared by overlapping segments merge (writability OR-ed,
/// `read_bytes` widened). On success the executable is protected
/// against writes until process exit, and the initial stack page is
/// resident.
pub fn load_executable<P: Platform>(
    ctx: &VmContext<P>,
    pid: Pid,
    file: &P::File,
    segments: &[Segment],
    fs: FsAccess<'_, '_>,
) -> Result<LoadedImage, LoadError> {
    let session = ctx.fs_session(fs);

    for segment in segments {
        if !validate_segment(segment, file) {
            log::warn!("[Loader] rejecting segment at {}", segment.vaddr);
            return Err(LoadError::BadSegment);
        }
    }

    let mut tables = ctx.lock_tables();
    let (state, share) = tables.parts();
    if !state.procs.contains_key(&pid) {
        return Err(LoadError::UnknownProcess);
    }

    let page_mask = PAGE_SIZE as u32 - 1;
    let mut segment_pages = 0usize;

    for segment in segments {
        let mut file_page = segment.offset & !page_mask;
        let mut page = UserPage::containing(segment.vaddr);
        let page_offset = segment.vaddr.as_u32() & page_mask;

        // How many bytes of the page run come from the file and how
        // many are zeroed, both rounded out to whole pages.
        let (mut read_bytes, mut zero_bytes) = if segment.file_size > 0 {
            let read = page_offset + segment.file_size;
            (read, round_up_to_page(page_offset + segment.mem_size) - read)
        } else {
            (0, round_up_to_page(page_offset + segment.mem_size))
        };

        log::debug!(
            "[Loader] segment at {}: {} read + {} zero bytes, {}",
            segment.vaddr,
            read_bytes,
            zero_bytes,
            if segment.writable { "rw" } else { "ro" }
        );

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = read_bytes.min(PAGE_SIZE as u32);
            let page_zero = PAGE_SIZE as u32 - page_read;

            let proc_vm = state.procs.get_mut(&pid).ok_or(LoadError::UnknownProcess)?;
            spt::create_file_page(
                &mut state.spt,
                &mut proc_vm.pages,
                pid,
                file.clone(),
                FileOfs::new(file_page),
                page,
                page_read,
                page_zero,
                segment.writable,
            );
            segment_pages += 1;

            read_bytes -= page_read;
            zero_bytes -= page_zero;
            file_page += PAGE_SIZE as u32;
            page = page.next().ok_or(LoadError::BadSegment)?;
        }
    }

    // Minimal stack: one page just below PHYS_BASE, faulted in through
    // the regular zero-fill path so ESP can start at PHYS_BASE.
    let stack_page = UserPage::containing(VirtAddr::new(PHYS_BASE - PAGE_SIZE as u32));
    let stack_id = {
        let proc_vm = state.procs.get_mut(&pid).ok_or(LoadError::UnknownProcess)?;
        spt::create_stack_page(&mut state.spt, &mut proc_vm.pages, pid, stack_page)
            .ok_or(LoadError::BadSegment)?
    };
    page_fault::load_swap_or_zero(ctx, state, share, stack_id, &session)
        .map_err(LoadError::StackSetup)?;

    // While the executable is loaded, writes to its backing file are
    // denied; process exit releases the reference.
    file.deny_write();
    if let Some(proc_vm) = state.procs.get_mut(&pid) {
        proc_vm.executable = Some(file.clone());
    }

    log::debug!(
        "[Loader] populated {} pages for {} plus initial stack",
        segment_pages,
        pid
    );
    Ok(LoadedImage {
        stack_pointer: VirtAddr::new(PHYS_BASE),
        segment_pages,
    })
}
