// src/constants.rs

//! Kernel constants and configuration values
//!
//! This module centralizes the geometry and policy constants of the
//! virtual memory core: page and sector sizes, the user/kernel address
//! split, and the stack-growth window.

/// Size of one page of virtual or physical memory, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of `PAGE_SIZE`.
pub const PAGE_SHIFT: u32 = 12;

/// First address above user space. User virtual addresses are
/// `0..PHYS_BASE`; everything at or above belongs to the kernel.
pub const PHYS_BASE: u32 = 0xC000_0000;

/// Size of one block-device sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of contiguous sectors that hold one page (a swap slot).
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// How far below `PHYS_BASE` the user stack may grow (8 MiB).
pub const STACK_LIMIT: u32 = 8 * 1024 * 1024;

/// Distance below ESP produced by a PUSH instruction that faults
/// before ESP is updated.
pub const STACK_PUSH_SLOP: u32 = 4;

/// Distance below ESP produced by a PUSHA instruction.
pub const STACK_PUSHA_SLOP: u32 = 32;

/// Exit code reported for a process killed by the fault handler.
pub const KILLED_EXIT_CODE: i32 = -1;
