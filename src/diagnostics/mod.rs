//! Diagnostic utilities
//!
//! Accounting for the simulated heap, so that the numbers a run reports can
//! be lined up against what external leak and memory-safety tooling sees.

pub mod memory;

pub use memory::{
    global_memory_tracker, start_memory_monitoring, MemorySnapshot, MemoryStatus, MemoryTracker,
};
