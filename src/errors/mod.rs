// src/errors/mod.rs

//! Unified error handling module
//!
//! This module provides a consistent error handling approach across
//! all VM subsystems.

pub mod unified;

// Re-export unified types
pub use unified::{
    ErrorContext, FaultError, LoadError, MmapError, ProcessError, Result as UnifiedResult,
    SwapError, VmError,
};
