// src/kernel/mm/mod.rs
//! メモリ管理モジュール
//!
//! 仮想メモリコアの中枢。[`VmContext`] がフレームテーブル、共有テーブル、
//! スワップストア、プロセスレジストリを 4 本のロックの下にまとめます。

pub mod frame;
pub mod mmap;
pub mod page_fault;
pub mod share;
pub mod spt;
pub mod swap;
pub mod types;

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::core::traits::{BlockDevice, Platform, UserFrame};
use crate::kernel::process::ProcessVm;
use crate::sync::{LockId, OrderedGuard, OrderedMutex};

use self::frame::FrameTable;
use self::share::ShareTable;
use self::spt::{PageKind, SptArena};
use self::swap::{SectorBitmap, SwapMap};
use self::types::{FileOfs, InodeId, Pid, VirtAddr};

/// State guarded by FRAME_LOCK: the frame table, the SPT arena and the
/// process registry.
///
/// The evictor manipulates residency state of foreign processes (their
/// page directories, SPT entries and mapping records), and process exit
/// tears its SPT down; both already need FRAME_LOCK, which is why this
/// state shares its lock.
pub struct VmState<P: Platform> {
    pub(crate) frames: FrameTable<P::Frame>,
    pub(crate) spt: SptArena<P::File>,
    pub(crate) procs: BTreeMap<Pid, ProcessVm<P>>,
}

/// Process-wide VM singletons, grouped for explicit init and teardown.
pub struct VmContext<P: Platform> {
    /// FRAME_LOCK
    vm: OrderedMutex<VmState<P>>,
    /// SHARE_LOCK
    share: OrderedMutex<ShareTable>,
    /// SWAP_LOCK
    swap: OrderedMutex<SwapMap>,
    /// BITMAP_LOCK
    sectors: OrderedMutex<SectorBitmap>,
    /// FILESYSTEM_LOCK (outermost relative to the VM locks)
    fs: OrderedMutex<()>,
    pool: P::Pool,
    device: P::Device,
    faults: AtomicU64,
}

/// Guard holding FRAME_LOCK and SHARE_LOCK as a pair.
///
/// Field order matters: guards drop in declaration order, so the share
/// lock is released first, the reverse of acquisition.
pub struct TablesGuard<'a, P: Platform> {
    share: OrderedGuard<'a, ShareTable>,
    vm: OrderedGuard<'a, VmState<P>>,
}

impl<'a, P: Platform> TablesGuard<'a, P> {
    /// Mutable access to both tables at once
    pub(crate) fn parts(&mut self) -> (&mut VmState<P>, &mut ShareTable) {
        (&mut self.vm, &mut self.share)
    }
}

/// Proof that the filesystem lock is held
pub struct FsGuard<'a> {
    _guard: OrderedGuard<'a, ()>,
}

/// How a VM entry point gets the filesystem lock.
///
/// The fault handler may run below a system call that already holds the
/// lock; re-testing ownership at runtime is forbidden, so the caller
/// states it explicitly.
pub enum FsAccess<'h, 'g> {
    /// The caller already holds the lock
    Held(&'h FsGuard<'g>),
    /// Acquire on entry, release on exit
    Acquire,
}

/// Filesystem-lock possession for the duration of a VM operation;
/// records whether acquisition was performed here.
pub(crate) enum FsSession<'a> {
    /// Lock owned by the caller; nothing to release
    Borrowed,
    /// Lock acquired by this operation; released on drop
    Owned(#[allow(dead_code)] FsGuard<'a>),
}

impl<P: Platform> VmContext<P> {
    /// Initialize the VM singletons over a user frame pool and the swap
    /// device. The sector bitmap covers the whole device.
    pub fn new(pool: P::Pool, device: P::Device) -> Self {
        let sectors = device.sector_count();
        Self {
            vm: OrderedMutex::new(
                LockId::Frame,
                VmState {
                    frames: FrameTable::new(),
                    spt: SptArena::new(),
                    procs: BTreeMap::new(),
                },
            ),
            share: OrderedMutex::new(LockId::Share, ShareTable::new()),
            swap: OrderedMutex::new(LockId::Swap, SwapMap::new()),
            sectors: OrderedMutex::new(LockId::Bitmap, SectorBitmap::new(sectors)),
            fs: OrderedMutex::new(LockId::Filesystem, ()),
            pool,
            device,
            faults: AtomicU64::new(0),
        }
    }

    /// Acquire FRAME_LOCK then SHARE_LOCK. This is the only order in
    /// which the pair is ever taken.
    pub fn lock_tables(&self) -> TablesGuard<'_, P> {
        let vm = self.vm.lock();
        let share = self.share.lock();
        TablesGuard { share, vm }
    }

    /// Acquire SWAP_LOCK then BITMAP_LOCK.
    pub(crate) fn lock_swap(
        &self,
    ) -> (OrderedGuard<'_, SwapMap>, OrderedGuard<'_, SectorBitmap>) {
        let map = self.swap.lock();
        let bitmap = self.sectors.lock();
        (map, bitmap)
    }

    /// Take the filesystem lock. System-call code holds this around its
    /// own file I/O and passes [`FsAccess::Held`] into the VM.
    pub fn fs_lock(&self) -> FsGuard<'_> {
        FsGuard {
            _guard: self.fs.lock(),
        }
    }

    pub(crate) fn fs_session<'s>(&'s self, access: FsAccess<'_, '_>) -> FsSession<'s> {
        match access {
            FsAccess::Held(_) => FsSession::Borrowed,
            FsAccess::Acquire => FsSession::Owned(self.fs_lock()),
        }
    }

    pub(crate) fn pool(&self) -> &P::Pool {
        &self.pool
    }

    pub(crate) fn device(&self) -> &P::Device {
        &self.device
    }

    pub(crate) fn count_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of page faults processed
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Snapshot of table occupancy, for diagnostics and tests
    pub fn stats(&self) -> VmStats {
        let frames = self.vm.lock().frames.len();
        let share_entries = self.share.lock().len();
        let swapped_pages = self.swap.lock().len();
        let swap_sectors = self.sectors.lock().set_count();
        VmStats {
            frames,
            share_entries,
            swapped_pages,
            swap_sectors,
            page_faults: self.fault_count(),
        }
    }

    /// Log the current statistics
    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "[VM] {} frames, {} shared, {} swapped, {} faults",
            stats.frames,
            stats.share_entries,
            stats.swapped_pages,
            stats.page_faults
        );
    }

    /// Alias count for a shared file region (0 when not shared)
    pub fn share_alias_count(&self, inode: InodeId, ofs: FileOfs) -> usize {
        self.share.lock().alias_count((inode, ofs))
    }

    /// Residency snapshot of one page of one process
    pub fn page_state(&self, pid: Pid, addr: VirtAddr) -> Option<PageState> {
        let mut tables = self.lock_tables();
        let (state, _share) = tables.parts();
        let id = state.procs.get(&pid)?.pages.lookup(addr)?;
        let entry = state.spt.get(id)?;
        Some(PageState {
            kind: entry.source.kind(),
            resident: entry.is_resident(),
            in_swap: entry.in_swap,
            writable: entry.writable,
        })
    }

    /// Number of SPT entries a process currently has
    pub fn page_count(&self, pid: Pid) -> usize {
        let mut tables = self.lock_tables();
        let (state, _share) = tables.parts();
        state.procs.get(&pid).map_or(0, |proc_vm| proc_vm.pages.len())
    }

    /// Name the process was registered under
    pub fn process_name(&self, pid: Pid) -> Option<alloc::string::String> {
        let mut tables = self.lock_tables();
        let (state, _share) = tables.parts();
        state.procs.get(&pid).map(|proc_vm| proc_vm.name().into())
    }

    /// Run `f` over the resident contents of the page covering `addr`.
    ///
    /// This is how kernel code (system calls, tests) reads user memory
    /// without going through the user mapping; `None` when the page is
    /// absent or not resident.
    pub fn with_page<R>(
        &self,
        pid: Pid,
        addr: VirtAddr,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let mut tables = self.lock_tables();
        let (state, _share) = tables.parts();
        let id = state.procs.get(&pid)?.pages.lookup(addr)?;
        let fid = state.spt.get(id)?.frame?;
        let frame = state.frames.get(fid)?;
        Some(f(frame.storage.contents()))
    }

    /// Mutable variant of [`VmContext::with_page`]. The caller is
    /// responsible for marking the page dirty in the page directory,
    /// as the hardware would on a user store.
    pub fn with_page_mut<R>(
        &self,
        pid: Pid,
        addr: VirtAddr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let mut tables = self.lock_tables();
        let (state, _share) = tables.parts();
        let id = state.procs.get(&pid)?.pages.lookup(addr)?;
        let fid = state.spt.get(id)?.frame?;
        let frame = state.frames.get_mut(fid)?;
        Some(f(frame.storage.contents_mut()))
    }
}

/// Occupancy snapshot of the VM tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// Frames currently owned by the frame table
    pub frames: usize,
    /// Entries in the share table
    pub share_entries: usize,
    /// Pages currently swapped out
    pub swapped_pages: usize,
    /// Occupied sectors on the swap device
    pub swap_sectors: usize,
    /// Page faults processed since init
    pub page_faults: u64,
}

/// Residency snapshot of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    /// Content source of the page
    pub kind: PageKind,
    /// Whether a frame currently backs the page
    pub resident: bool,
    /// Whether the contents live in swap
    pub in_swap: bool,
    /// Whether the page may be written
    pub writable: bool,
}
