// src/lib.rs
//! Tiny VM - 教育用カーネルの仮想メモリコア
//!
//! trait ベースの抽象化と型安全性を最大化したデマンドページング実装。
//! スケジューラ・ファイルシステム・ブロック層は [`kernel::core::traits`]
//! のインターフェース越しにのみ触れる。

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unused_must_use)]

extern crate alloc;

pub mod constants;
pub mod errors;
pub mod kernel;
pub mod sync;

pub use errors::unified::{FaultError, LoadError, MmapError, ProcessError, SwapError, VmError};
pub use kernel::core::traits::{
    BlockDevice, FileHandle, FramePool, PageDirectory, Platform, UserFrame,
};
pub use kernel::loader::{LoadedImage, Segment, load_executable};
pub use kernel::mm::mmap::{mmap, munmap};
pub use kernel::mm::page_fault::{FaultCode, FaultInfo, FaultOutcome, handle_page_fault};
pub use kernel::mm::spt::PageKind;
pub use kernel::mm::types::{
    FileOfs, InodeId, KernPage, Mapid, Pid, SectorIndex, UserPage, VirtAddr,
};
pub use kernel::mm::{FsAccess, FsGuard, PageState, VmContext, VmStats};
pub use kernel::process::{process_exit, register_process};
