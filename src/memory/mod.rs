//! Simulated memory
//!
//! - **heap**: byte buffers addressed by ownership tokens with detected
//!   double releases and use-after-release reads
//! - **arena**: nodes linked by owning and weak edges, for building reference
//!   cycles that naive reference counting cannot reclaim

pub mod arena;
pub mod heap;

pub use arena::{EdgeKind, NodeArena, NodeId};
pub use heap::{BufferHandle, BufferHeap, HeapStats, MemoryFault, RawBuffer};
