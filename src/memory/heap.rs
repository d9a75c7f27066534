//! Simulated heap of explicitly owned byte buffers
//!
//! Buffers are addressed by [`BufferHandle`], an ownership token that carries
//! a slot index and a generation. Releasing a buffer bumps the slot's
//! generation, so every later release or read through the same token is
//! detected and reported as a [`MemoryFault`] instead of touching memory that
//! no longer belongs to the caller.
//!
//! # Design
//!
//! - Slots live in a `Vec` guarded by one mutex; vacant slots form a free list
//! - A token is valid only while its generation matches the slot's
//! - Generations never wrap: a slot whose generation is exhausted is retired
//!   instead of being reused
//! - Every allocation and release is reported to a [`MemoryTracker`]

use crate::diagnostics::MemoryTracker;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Ownership token for a buffer on the simulated heap
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Creates a handle from raw parts (primarily for testing)
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({}:{})", self.index, self.generation)
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Misuse of a buffer handle, detected at the point of use
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// The handle was already released
    #[error("double release of buffer {handle}")]
    DoubleRelease { handle: BufferHandle },

    /// The handle was read after it had been released
    #[error("use after release of buffer {handle}")]
    UseAfterRelease { handle: BufferHandle },

    /// The handle never referred to an allocation on this heap
    #[error("invalid buffer handle {handle}")]
    InvalidHandle { handle: BufferHandle },
}

impl MemoryFault {
    pub fn handle(&self) -> BufferHandle {
        match self {
            MemoryFault::DoubleRelease { handle }
            | MemoryFault::UseAfterRelease { handle }
            | MemoryFault::InvalidHandle { handle } => *handle,
        }
    }
}

/// A slot is live while it holds bytes
#[derive(Debug)]
struct Slot {
    generation: u32,
    bytes: Option<Vec<u8>>,
}

/// How a token relates to the slot it names
enum TokenState {
    Live,
    /// Issued earlier and since released
    Stale,
    /// Never issued by this heap
    Unknown,
}

impl Slot {
    fn classify(&self, handle: BufferHandle) -> TokenState {
        match (&self.bytes, handle.generation.cmp(&self.generation)) {
            (Some(_), Ordering::Equal) => TokenState::Live,
            (None, Ordering::Equal) | (_, Ordering::Less) => TokenState::Stale,
            (_, Ordering::Greater) => TokenState::Unknown,
        }
    }
}

/// Counters for everything the heap has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub allocations: u64,
    pub releases: u64,
    pub release_attempts: u64,
    pub double_releases: u64,
    pub faulted_reads: u64,
    pub live: usize,
}

#[derive(Debug)]
struct HeapInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    generation_limit: u32,
    retired: usize,
    stats: HeapStats,
}

impl HeapInner {
    fn new(generation_limit: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            generation_limit,
            retired: 0,
            stats: HeapStats::default(),
        }
    }

    fn classify(&self, handle: BufferHandle) -> TokenState {
        self.slots
            .get(handle.index as usize)
            .map_or(TokenState::Unknown, |slot| slot.classify(handle))
    }
}

/// Thread-safe heap of explicitly released buffers
pub struct BufferHeap {
    inner: Mutex<HeapInner>,
    tracker: MemoryTracker,
}

impl Default for BufferHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeap")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferHeap {
    /// Create a heap with its own tracker
    pub fn new() -> Self {
        Self::with_tracker(MemoryTracker::new())
    }

    /// Create a heap that reports to `tracker`
    pub fn with_tracker(tracker: MemoryTracker) -> Self {
        Self::with_generation_limit(tracker, u32::MAX)
    }

    fn with_generation_limit(tracker: MemoryTracker, generation_limit: u32) -> Self {
        Self {
            inner: Mutex::new(HeapInner::new(generation_limit)),
            tracker,
        }
    }

    pub fn tracker(&self) -> &MemoryTracker {
        &self.tracker
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `bytes` and return a token for them
    pub fn allocate_from(&self, bytes: Vec<u8>) -> BufferHandle {
        let size = bytes.len() as u64;
        let mut inner = self.lock();

        let handle = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.bytes = Some(bytes);
                BufferHandle::new(index, slot.generation)
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    bytes: Some(bytes),
                });
                BufferHandle::new(index, 0)
            }
        };

        inner.stats.allocations += 1;
        inner.stats.live += 1;
        drop(inner);

        self.tracker.record_allocation(size);
        trace!(%handle, size, "Buffer allocated");
        handle
    }

    /// Allocate `size` bytes, each set to `fill`
    pub fn allocate_filled(&self, size: usize, fill: u8) -> BufferHandle {
        self.allocate_from(vec![fill; size])
    }

    /// Release the buffer behind `handle`
    ///
    /// The first release of a live handle succeeds. Any further release of
    /// the same token returns [`MemoryFault::DoubleRelease`].
    pub fn release(&self, handle: BufferHandle) -> Result<(), MemoryFault> {
        let mut inner = self.lock();
        inner.stats.release_attempts += 1;

        match inner.classify(handle) {
            TokenState::Live => {}
            TokenState::Stale => {
                inner.stats.double_releases += 1;
                return Err(MemoryFault::DoubleRelease { handle });
            }
            TokenState::Unknown => return Err(MemoryFault::InvalidHandle { handle }),
        }

        let limit = inner.generation_limit;
        let slot = &mut inner.slots[handle.index as usize];
        let size = slot.bytes.take().map_or(0, |bytes| bytes.len() as u64);
        if slot.generation < limit {
            slot.generation += 1;
            inner.free.push(handle.index);
        } else {
            // Exhausted; the generation stays put so old tokens remain stale
            inner.retired += 1;
            debug!(index = handle.index, "Heap slot retired");
        }

        inner.stats.releases += 1;
        inner.stats.live -= 1;
        drop(inner);

        self.tracker.record_deallocation(size);
        trace!(%handle, size, "Buffer released");
        Ok(())
    }

    /// Run `f` over the bytes behind `handle`
    pub fn with_bytes<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, MemoryFault> {
        let mut inner = self.lock();
        let fault = match inner.classify(handle) {
            TokenState::Live => {
                if let Some(bytes) = &inner.slots[handle.index as usize].bytes {
                    return Ok(f(bytes));
                }
                MemoryFault::UseAfterRelease { handle }
            }
            TokenState::Stale => MemoryFault::UseAfterRelease { handle },
            TokenState::Unknown => MemoryFault::InvalidHandle { handle },
        };
        inner.stats.faulted_reads += 1;
        Err(fault)
    }

    /// Copy the buffer into `dst`, returning the number of bytes copied
    pub fn copy_into(&self, handle: BufferHandle, dst: &mut [u8]) -> Result<usize, MemoryFault> {
        self.with_bytes(handle, |bytes| {
            let n = bytes.len().min(dst.len());
            dst[..n].copy_from_slice(&bytes[..n]);
            n
        })
    }

    /// Copy the buffer out
    pub fn read(&self, handle: BufferHandle) -> Result<Vec<u8>, MemoryFault> {
        self.with_bytes(handle, <[u8]>::to_vec)
    }

    /// Whether `handle` still refers to a live allocation
    pub fn is_live(&self, handle: BufferHandle) -> bool {
        matches!(self.lock().classify(handle), TokenState::Live)
    }

    /// Slots withdrawn from reuse after exhausting their generations
    pub fn retired_slots(&self) -> usize {
        self.lock().retired
    }

    pub fn live_count(&self) -> usize {
        self.lock().stats.live
    }

    pub fn stats(&self) -> HeapStats {
        self.lock().stats
    }
}

/// A heap buffer handed to a caller together with the heap that owns it
///
/// Cloning a `RawBuffer` copies the token, not the buffer: all clones refer
/// to the same allocation and only one release of it can succeed.
#[derive(Clone)]
pub struct RawBuffer {
    heap: Arc<BufferHeap>,
    handle: BufferHandle,
    size: usize,
}

impl RawBuffer {
    pub fn new(heap: Arc<BufferHeap>, handle: BufferHandle, size: usize) -> Self {
        Self { heap, handle, size }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Size the buffer had when it was allocated
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_live(&self) -> bool {
        self.heap.is_live(self.handle)
    }

    pub fn release(&self) -> Result<(), MemoryFault> {
        self.heap.release(self.handle)
    }

    pub fn read(&self) -> Result<Vec<u8>, MemoryFault> {
        self.heap.read(self.handle)
    }

    pub fn copy_into(&self, dst: &mut [u8]) -> Result<usize, MemoryFault> {
        self.heap.copy_into(self.handle, dst)
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}
