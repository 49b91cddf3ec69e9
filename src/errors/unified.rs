// src/errors/unified.rs

//! Unified error types for the virtual memory core
//!
//! This module provides a consistent error handling approach across
//! all VM subsystems.

use core::fmt;

/// Top-level VM error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Page-fault resolution error
    Fault(FaultError),
    /// Memory-mapped file error
    Mmap(MmapError),
    /// Swap store error
    Swap(SwapError),
    /// Loader adapter error
    Load(LoadError),
    /// Process registry error
    Process(ProcessError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Fault(e) => write!(f, "fault error: {}", e),
            VmError::Mmap(e) => write!(f, "mmap error: {}", e),
            VmError::Swap(e) => write!(f, "swap error: {}", e),
            VmError::Load(e) => write!(f, "load error: {}", e),
            VmError::Process(e) => write!(f, "process error: {}", e),
        }
    }
}

/// Errors raised while resolving a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Fault address has no SPT entry and is not stack-eligible
    NoSuchMapping,
    /// Kernel-only address in a user fault, or an unexpected kernel fault
    InvalidUserAccess,
    /// No frame available and nothing evictable
    OutOfFrames,
    /// File read returned fewer bytes than requested
    ShortRead,
    /// Page-directory installation failed
    InstallFailed,
    /// Underlying swap store error
    Swap(SwapError),
}

impl FaultError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FaultError::NoSuchMapping => "no such mapping",
            FaultError::InvalidUserAccess => "invalid user access",
            FaultError::OutOfFrames => "out of frames",
            FaultError::ShortRead => "short read",
            FaultError::InstallFailed => "install failed",
            FaultError::Swap(SwapError::OutOfSlots) => "out of swap",
            FaultError::Swap(SwapError::MissingEntry) => "missing swap entry",
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FaultError> for VmError {
    fn from(err: FaultError) -> Self {
        VmError::Fault(err)
    }
}

/// Errors raised by `mmap`
///
/// Every variant maps to `MAP_FAILED` at the system-call boundary; the
/// distinction exists for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// fd 0 or 1 (console descriptors cannot be mapped)
    BadDescriptor,
    /// Target address is NULL
    NullAddress,
    /// Target address is not page-aligned
    Misaligned,
    /// Target address is not in user space
    KernelAddress,
    /// Backing file has length <= 0
    EmptyFile,
    /// Re-opening the file for an independent handle failed
    ReopenFailed,
    /// Target region overlaps an existing SPT entry
    AlreadyMapped,
    /// The calling process is not registered
    UnknownProcess,
}

impl MmapError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MmapError::BadDescriptor => "bad descriptor",
            MmapError::NullAddress => "null address",
            MmapError::Misaligned => "misaligned address",
            MmapError::KernelAddress => "kernel address",
            MmapError::EmptyFile => "empty file",
            MmapError::ReopenFailed => "reopen failed",
            MmapError::AlreadyMapped => "already mapped",
            MmapError::UnknownProcess => "unknown process",
        }
    }
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MmapError> for VmError {
    fn from(err: MmapError) -> Self {
        VmError::Mmap(err)
    }
}

/// Errors raised by the swap store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// No contiguous run of free sectors large enough for a page
    OutOfSlots,
    /// No swap-map entry for the given SPT entry (caller must consult
    /// `in_swap` first)
    MissingEntry,
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::OutOfSlots => write!(f, "no free swap slot"),
            SwapError::MissingEntry => write!(f, "missing swap entry"),
        }
    }
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        VmError::Swap(err)
    }
}

impl From<SwapError> for FaultError {
    fn from(err: SwapError) -> Self {
        FaultError::Swap(err)
    }
}

/// Errors raised by the loader adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Segment failed validation (misaligned, out of user space, wraps,
    /// or touches page 0)
    BadSegment,
    /// The target process is not registered
    UnknownProcess,
    /// Faulting in the initial stack page failed
    StackSetup(FaultError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadSegment => write!(f, "bad segment"),
            LoadError::UnknownProcess => write!(f, "unknown process"),
            LoadError::StackSetup(e) => write!(f, "stack setup failed: {}", e),
        }
    }
}

impl From<LoadError> for VmError {
    fn from(err: LoadError) -> Self {
        VmError::Load(err)
    }
}

/// Errors raised by the process registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// A process with this pid is already registered
    AlreadyRegistered,
    /// No process with this pid is registered
    Unknown,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::AlreadyRegistered => write!(f, "already registered"),
            ProcessError::Unknown => write!(f, "unknown process"),
        }
    }
}

impl From<ProcessError> for VmError {
    fn from(err: ProcessError) -> Self {
        VmError::Process(err)
    }
}

/// Result type alias for VM operations
pub type Result<T> = core::result::Result<T, VmError>;

/// Helper trait for error context
pub trait ErrorContext {
    /// Get a detailed description of the error
    fn context(&self) -> &'static str;
}

impl ErrorContext for VmError {
    fn context(&self) -> &'static str {
        match self {
            VmError::Fault(_) => "Error occurred while resolving a page fault",
            VmError::Mmap(_) => "Error occurred in the memory-map registry",
            VmError::Swap(_) => "Error occurred in the swap store",
            VmError::Load(_) => "Error occurred in the loader adapter",
            VmError::Process(_) => "Error occurred in the process registry",
        }
    }
}

impl ErrorContext for FaultError {
    fn context(&self) -> &'static str {
        match self {
            FaultError::NoSuchMapping => "Fault address is not mapped and is not stack-eligible",
            FaultError::InvalidUserAccess => "Fault address violates the user/kernel split",
            FaultError::OutOfFrames => "User frame pool exhausted with no evictable frame",
            FaultError::ShortRead => "Backing file ended before the page was filled",
            FaultError::InstallFailed => "Page directory refused the mapping",
            FaultError::Swap(_) => "Swap store failed while resolving the fault",
        }
    }
}

impl ErrorContext for MmapError {
    fn context(&self) -> &'static str {
        match self {
            MmapError::BadDescriptor => "Console descriptors cannot back a mapping",
            MmapError::NullAddress => "NULL cannot be the base of a mapping",
            MmapError::Misaligned => "Mapping base must be page-aligned",
            MmapError::KernelAddress => "Mapping must lie entirely in user space",
            MmapError::EmptyFile => "Zero-length files cannot be mapped",
            MmapError::ReopenFailed => "Could not obtain an independent file handle",
            MmapError::AlreadyMapped => "Mapping region overlaps existing pages",
            MmapError::UnknownProcess => "Caller has no registered VM state",
        }
    }
}
