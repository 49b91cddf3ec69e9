// src/kernel/process/mod.rs
//! Per-process VM state and lifecycle
//!
//! A process participates in the VM through its [`ProcessVm`]: the page
//! directory handle, the supplemental page table, the mapping records
//! and the deny-write reference on its executable. Registration and
//! teardown run under FRAME_LOCK like every other mutation of the
//! registry.

use alloc::string::String;
use alloc::vec::Vec;

use crate::errors::unified::ProcessError;
use crate::kernel::core::traits::{FileHandle, Platform};
use crate::kernel::mm::mmap::{self, MmapRegistry};
use crate::kernel::mm::spt::SuppPageTable;
use crate::kernel::mm::types::{Mapid, Pid};
use crate::kernel::mm::{frame, swap, FsAccess, VmContext};

/// VM-side state of one process
pub struct ProcessVm<P: Platform> {
    name: String,
    pub(crate) pd: P::PageDirectory,
    pub(crate) pages: SuppPageTable,
    pub(crate) mmaps: MmapRegistry,
    pub(crate) executable: Option<P::File>,
    next_mapid: i32,
}

impl<P: Platform> ProcessVm<P> {
    fn new(name: String, pd: P::PageDirectory) -> Self {
        Self {
            name,
            pd,
            pages: SuppPageTable::new(),
            mmaps: MmapRegistry::new(),
            executable: None,
            next_mapid: 0,
        }
    }

    /// The process name used in kernel messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand out the next mapping id
    pub(crate) fn take_mapid(&mut self) -> Mapid {
        let id = Mapid::new(self.next_mapid);
        self.next_mapid += 1;
        id
    }
}

/// Register a process with the VM.
///
/// Fails if the pid is already present.
pub fn register_process<P: Platform>(
    ctx: &VmContext<P>,
    pid: Pid,
    name: &str,
    pd: P::PageDirectory,
) -> Result<(), ProcessError> {
    let mut tables = ctx.lock_tables();
    let (state, _share) = tables.parts();
    if state.procs.contains_key(&pid) {
        return Err(ProcessError::AlreadyRegistered);
    }
    state.procs.insert(pid, ProcessVm::new(name.into(), pd));
    log::debug!("[Process] registered {} ({})", pid, name);
    Ok(())
}

/// Tear down a process's VM state on exit.
///
/// Unmaps every mapping (flushing dirty pages), destroys every SPT
/// entry (freeing frames and swap slots), releases the deny-write
/// reference on the executable and drops the registry entry. Unknown
/// pids are ignored.
pub fn process_exit<P: Platform>(ctx: &VmContext<P>, pid: Pid, fs: FsAccess<'_, '_>) {
    let session = ctx.fs_session(fs);
    let mut tables = ctx.lock_tables();
    let (state, share) = tables.parts();

    let mapids = match state.procs.get(&pid) {
        Some(proc_vm) => proc_vm.mmaps.mapids(),
        None => return,
    };
    for mapid in mapids {
        mmap::munmap_locked(ctx, state, share, pid, mapid, &session);
    }

    let ids: Vec<_> = match state.procs.get(&pid) {
        Some(proc_vm) => proc_vm.pages.ids().collect(),
        None => return,
    };
    for id in ids {
        frame::free_from_spt(ctx, state, share, id);
        if let Some(entry) = state.spt.remove(id) {
            if entry.in_swap {
                let (mut map, mut bitmap) = ctx.lock_swap();
                swap::release_slot(&mut map, &mut bitmap, id);
            }
        }
    }

    if let Some(proc_vm) = state.procs.remove(&pid) {
        if let Some(executable) = proc_vm.executable {
            executable.allow_write();
        }
        log::debug!("[Process] tore down {} ({})", pid, proc_vm.name);
    }
}
