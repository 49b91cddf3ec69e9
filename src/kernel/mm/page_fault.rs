// src/kernel/mm/page_fault.rs
//! Page-fault handling
//!
//! Decodes the hardware error code, consults the faulting process's
//! supplemental page table and loads the page from its source (file,
//! swap, zero-fill), growing the stack on qualifying faults. A fault
//! that cannot be resolved terminates the process with exit code -1.
//!
//! The trap glue is the embedder's: it must read the faulting address
//! from CR2 before re-enabling interrupts, then call
//! [`handle_page_fault`]. If the faulting code path already holds the
//! filesystem lock it passes [`FsAccess::Held`]; the handler never
//! re-tests lock ownership at runtime.

use bitflags::bitflags;

use crate::constants::{
    KILLED_EXIT_CODE, PHYS_BASE, STACK_LIMIT, STACK_PUSH_SLOP, STACK_PUSHA_SLOP,
};
use crate::errors::unified::FaultError;
use crate::kernel::core::traits::{FileHandle, PageDirectory, Platform, UserFrame};
use crate::kernel::mm::{FsAccess, FsSession, VmContext, VmState};

use super::frame;
use super::share::ShareTable;
use super::spt::{self, PageKind, PageSource, SptId};
use super::swap;
use super::types::{Pid, UserPage, VirtAddr};

bitflags! {
    /// Page-fault error code bits pushed by the CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// 0: not-present page, 1: rights violation
        const PRESENT = 1 << 0;
        /// 0: read access, 1: write access
        const WRITE = 1 << 1;
        /// 0: kernel context, 1: user context
        const USER = 1 << 2;
    }
}

/// Everything the handler needs about one fault
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting virtual address (from CR2)
    pub addr: VirtAddr,
    /// Hardware error code bits
    pub code: FaultCode,
    /// User stack pointer saved in the trap frame
    pub esp: VirtAddr,
}

/// Disposition of a handled fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was loaded; the faulting instruction restarts
    Resolved,
    /// The process must be terminated with the given exit code; the
    /// caller completes teardown via `process_exit`
    Terminated {
        /// Exit code to report
        exit_code: i32,
    },
    /// The fault originated in kernel code and could not be resolved;
    /// the embedder should treat this as a kernel bug
    KernelFault,
}

/// Resolve a page fault for `pid`.
pub fn handle_page_fault<P: Platform>(
    ctx: &VmContext<P>,
    pid: Pid,
    fault: FaultInfo,
    fs: FsAccess<'_, '_>,
) -> FaultOutcome {
    ctx.count_fault();
    let session = ctx.fs_session(fs);

    let not_present = !fault.code.contains(FaultCode::PRESENT);
    let mut result: Result<(), FaultError> = Err(FaultError::NoSuchMapping);

    if not_present && fault.addr.is_user() {
        let mut tables = ctx.lock_tables();
        let (state, share) = tables.parts();
        let id = state
            .procs
            .get(&pid)
            .and_then(|proc_vm| proc_vm.pages.lookup(fault.addr));
        if let Some(id) = id {
            result = load_entry(ctx, state, share, id, &session);
        }
    }

    // Even without an SPT entry the fault may be a legitimate stack
    // access just below what has been allocated so far.
    if result.is_err() && stack_eligible(fault.addr, fault.esp) {
        let mut tables = ctx.lock_tables();
        let (state, share) = tables.parts();
        let page = UserPage::containing(fault.addr);
        let created = match state.procs.get_mut(&pid) {
            Some(proc_vm) => spt::create_stack_page(&mut state.spt, &mut proc_vm.pages, pid, page),
            None => None,
        };
        if let Some(id) = created {
            result = load_swap_or_zero(ctx, state, share, id, &session);
        }
    }

    match result {
        Ok(()) => FaultOutcome::Resolved,
        Err(error) => fail(ctx, pid, fault, error),
    }
}

/// Report an unresolvable fault and decide the disposition.
fn fail<P: Platform>(
    ctx: &VmContext<P>,
    pid: Pid,
    fault: FaultInfo,
    error: FaultError,
) -> FaultOutcome {
    log::warn!(
        "Page fault at {}: {} error {} page in {} context ({}).",
        fault.addr,
        if fault.code.contains(FaultCode::PRESENT) {
            "rights violation"
        } else {
            "not present"
        },
        if fault.code.contains(FaultCode::WRITE) {
            "writing"
        } else {
            "reading"
        },
        if fault.code.contains(FaultCode::USER) {
            "user"
        } else {
            "kernel"
        },
        error
    );

    if fault.code.contains(FaultCode::USER) {
        if let Some(name) = ctx.process_name(pid) {
            log::info!("{}: exit({})", name, KILLED_EXIT_CODE);
        }
        FaultOutcome::Terminated {
            exit_code: KILLED_EXIT_CODE,
        }
    } else {
        FaultOutcome::KernelFault
    }
}

/// Stack-growth eligibility: inside user space, within the stack
/// window below `PHYS_BASE`, and consistent with a stack access
/// (at or above ESP, or exactly a PUSH/PUSHA probe below it).
pub(crate) fn stack_eligible(addr: VirtAddr, esp: VirtAddr) -> bool {
    if !addr.is_user() {
        return false;
    }
    let page_base = UserPage::containing(addr).base().as_u32();
    if PHYS_BASE - page_base > STACK_LIMIT {
        return false;
    }
    addr.as_u32() >= esp.as_u32()
        || addr == esp.wrapping_sub(STACK_PUSH_SLOP)
        || addr == esp.wrapping_sub(STACK_PUSHA_SLOP)
}

/// Dispatch on the entry's source kind.
fn load_entry<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    id: SptId,
    session: &FsSession<'_>,
) -> Result<(), FaultError> {
    let (kind, in_swap) = {
        let entry = state.spt.get(id).ok_or(FaultError::NoSuchMapping)?;
        (entry.source.kind(), entry.in_swap)
    };
    match kind {
        PageKind::Mmap => load_from_file(ctx, state, share, id, session),
        PageKind::Stack | PageKind::File if in_swap => {
            load_from_swap(ctx, state, share, id, session)
        }
        PageKind::Stack => load_swap_or_zero(ctx, state, share, id, session),
        PageKind::File => load_from_file(ctx, state, share, id, session),
    }
}

/// Load a FILE or MMAP page from the filesystem.
///
/// Read-only file pages first try the share table; on a hit the
/// existing frame is installed and aliased. Otherwise a fresh frame is
/// filled from the file (zero-padded), installed, and - for read-only
/// file pages - entered into the share table.
fn load_from_file<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    id: SptId,
    session: &FsSession<'_>,
) -> Result<(), FaultError> {
    let (page, owner, writable, file, ofs, read_bytes, is_file) = {
        let entry = state.spt.get(id).ok_or(FaultError::NoSuchMapping)?;
        let (file, ofs, read_bytes, is_file) = match &entry.source {
            PageSource::File {
                file,
                ofs,
                read_bytes,
                ..
            } => (file.clone(), *ofs, *read_bytes, true),
            PageSource::Mmap {
                file,
                ofs,
                read_bytes,
                ..
            } => (file.clone(), *ofs, *read_bytes, false),
            PageSource::Stack => return Err(FaultError::NoSuchMapping),
        };
        (
            entry.page,
            entry.owner,
            entry.writable,
            file,
            ofs,
            read_bytes,
            is_file,
        )
    };

    let sharing = is_file && !writable;
    let share_key = (file.inode(), ofs);

    if sharing {
        if let Some(existing) = share.find(share_key) {
            let fid = existing.frame;
            let kpage = state
                .frames
                .get(fid)
                .ok_or(FaultError::NoSuchMapping)?
                .storage
                .kpage();
            let installed = state
                .procs
                .get(&owner)
                .map(|proc_vm| proc_vm.pd.install(page, kpage, writable))
                .unwrap_or(false);
            if !installed {
                return Err(FaultError::InstallFailed);
            }
            share.add_alias(share_key, id);
            if let Some(entry) = state.spt.get_mut(id) {
                entry.frame = Some(fid);
            }
            log::trace!("[PageFault] shared frame for {} at {}", owner, page);
            return Ok(());
        }
    }

    let fid = frame::allocate_frame(ctx, state, share, id, false, session)?;

    // Fill before install: the page becomes visible to the process only
    // with its final contents.
    {
        let frame = state.frames.get_mut(fid).ok_or(FaultError::NoSuchMapping)?;
        let buf = frame.storage.contents_mut();
        let got = file.read_at(&mut buf[..read_bytes as usize], ofs);
        if got != read_bytes as usize {
            frame::discard_frame(ctx, state, fid);
            return Err(FaultError::ShortRead);
        }
        buf[read_bytes as usize..].fill(0);
    }

    let kpage = state
        .frames
        .get(fid)
        .ok_or(FaultError::NoSuchMapping)?
        .storage
        .kpage();
    let installed = state
        .procs
        .get(&owner)
        .map(|proc_vm| proc_vm.pd.install(page, kpage, writable))
        .unwrap_or(false);
    if !installed {
        frame::discard_frame(ctx, state, fid);
        return Err(FaultError::InstallFailed);
    }

    if let Some(entry) = state.spt.get_mut(id) {
        entry.frame = Some(fid);
    }
    if sharing {
        share.insert_new(share_key, id, fid);
    }
    Ok(())
}

/// Bring a swapped-out page back into a fresh frame.
fn load_from_swap<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    id: SptId,
    session: &FsSession<'_>,
) -> Result<(), FaultError> {
    let (page, owner, writable) = {
        let entry = state.spt.get(id).ok_or(FaultError::NoSuchMapping)?;
        (entry.page, entry.owner, entry.writable)
    };

    let fid = frame::allocate_frame(ctx, state, share, id, false, session)?;

    {
        let (mut map, mut bitmap) = ctx.lock_swap();
        let frame = state.frames.get_mut(fid).ok_or(FaultError::NoSuchMapping)?;
        if let Err(error) = swap::read_in(
            &mut map,
            &mut bitmap,
            ctx.device(),
            id,
            frame.storage.contents_mut(),
        ) {
            drop(bitmap);
            drop(map);
            frame::discard_frame(ctx, state, fid);
            return Err(error.into());
        }
    }
    // The slot is gone; the entry's contents now live only in the frame.
    if let Some(entry) = state.spt.get_mut(id) {
        entry.in_swap = false;
    }

    let kpage = state
        .frames
        .get(fid)
        .ok_or(FaultError::NoSuchMapping)?
        .storage
        .kpage();
    let installed = state
        .procs
        .get(&owner)
        .map(|proc_vm| proc_vm.pd.install(page, kpage, writable))
        .unwrap_or(false);
    if !installed {
        frame::discard_frame(ctx, state, fid);
        return Err(FaultError::InstallFailed);
    }
    if let Some(entry) = state.spt.get_mut(id) {
        entry.frame = Some(fid);
    }
    Ok(())
}

/// STACK path: restore from swap when `in_swap`, otherwise hand out a
/// zero-filled frame.
pub(crate) fn load_swap_or_zero<P: Platform>(
    ctx: &VmContext<P>,
    state: &mut VmState<P>,
    share: &mut ShareTable,
    id: SptId,
    session: &FsSession<'_>,
) -> Result<(), FaultError> {
    let (page, owner, writable, in_swap) = {
        let entry = state.spt.get(id).ok_or(FaultError::NoSuchMapping)?;
        (entry.page, entry.owner, entry.writable, entry.in_swap)
    };
    if in_swap {
        return load_from_swap(ctx, state, share, id, session);
    }

    let fid = frame::allocate_frame(ctx, state, share, id, true, session)?;
    let kpage = state
        .frames
        .get(fid)
        .ok_or(FaultError::NoSuchMapping)?
        .storage
        .kpage();
    let installed = state
        .procs
        .get(&owner)
        .map(|proc_vm| proc_vm.pd.install(page, kpage, writable))
        .unwrap_or(false);
    if !installed {
        frame::discard_frame(ctx, state, fid);
        return Err(FaultError::InstallFailed);
    }
    if let Some(entry) = state.spt.get_mut(id) {
        entry.frame = Some(fid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    const STACK_PAGE: u32 = PHYS_BASE - PAGE_SIZE as u32;

    #[test]
    fn test_push_probe_is_eligible() {
        // ESP one byte below an allocated page; PUSH faults 4 below.
        let esp = VirtAddr::new(STACK_PAGE - 1);
        assert!(stack_eligible(esp.wrapping_sub(4), esp));
    }

    #[test]
    fn test_pusha_probe_is_eligible() {
        let esp = VirtAddr::new(STACK_PAGE - 1);
        assert!(stack_eligible(esp.wrapping_sub(32), esp));
    }

    #[test]
    fn test_access_above_esp_is_eligible() {
        let esp = VirtAddr::new(STACK_PAGE - 64);
        assert!(stack_eligible(VirtAddr::new(STACK_PAGE - 8), esp));
    }

    #[test]
    fn test_wild_access_below_esp_is_rejected() {
        let esp = VirtAddr::new(STACK_PAGE);
        assert!(!stack_eligible(esp.wrapping_sub(100), esp));
    }

    #[test]
    fn test_overflow_past_window_is_rejected() {
        let esp = VirtAddr::new(PHYS_BASE - STACK_LIMIT - 0x2000);
        assert!(!stack_eligible(esp.wrapping_sub(4), esp));
    }

    #[test]
    fn test_kernel_address_is_rejected() {
        let esp = VirtAddr::new(PHYS_BASE + 0x1000);
        assert!(!stack_eligible(VirtAddr::new(PHYS_BASE + 0x1000), esp));
    }

    #[test]
    fn test_fault_code_bits() {
        let code = FaultCode::WRITE | FaultCode::USER;
        assert!(!code.contains(FaultCode::PRESENT));
        assert!(code.contains(FaultCode::WRITE));
        assert!(code.contains(FaultCode::USER));
    }
}
