//! Fault selectors and process-wide fault state
//!
//! [`FaultStore`] is the process-scoped home of every manufactured defect:
//! the simulated heap, the list of buffers leaked on purpose, and the arena
//! holding reference cycles. It starts empty and is never torn down; the
//! instance behind [`global_fault_store`] lives until the process exits.

use crate::error::HarnessError;
use crate::memory::{BufferHandle, BufferHeap, EdgeKind, MemoryFault, NodeArena, NodeId, RawBuffer};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Fill byte for buffers leaked on purpose
const LEAK_FILL: u8 = 0xAB;

/// Fill byte for buffers released twice on purpose
const DOUBLE_RELEASE_FILL: u8 = 0xCD;

/// Which defect a simulated call manufactures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultSelector {
    /// No defect; the response buffer has a single owner and a single release
    #[default]
    None,

    /// Retain an unrelated buffer forever
    LeakBuffer,

    /// Release a small unrelated buffer twice
    DoubleRelease,

    /// Build two nodes that own each other
    ReferenceCycle,

    /// Release the response buffer before handing it back
    DanglingReference,
}

impl FaultSelector {
    pub const ALL: [FaultSelector; 5] = [
        FaultSelector::None,
        FaultSelector::LeakBuffer,
        FaultSelector::DoubleRelease,
        FaultSelector::ReferenceCycle,
        FaultSelector::DanglingReference,
    ];

    /// Map a numeric danger level (0-4) to a selector
    pub fn from_danger_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }

    pub fn danger_level(self) -> u8 {
        match self {
            FaultSelector::None => 0,
            FaultSelector::LeakBuffer => 1,
            FaultSelector::DoubleRelease => 2,
            FaultSelector::ReferenceCycle => 3,
            FaultSelector::DanglingReference => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultSelector::None => "none",
            FaultSelector::LeakBuffer => "leak-buffer",
            FaultSelector::DoubleRelease => "double-release",
            FaultSelector::ReferenceCycle => "reference-cycle",
            FaultSelector::DanglingReference => "dangling-reference",
        }
    }
}

impl fmt::Display for FaultSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultSelector {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        if let Ok(level) = normalized.parse::<u8>() {
            return Self::from_danger_level(level).ok_or_else(|| {
                HarnessError::InvalidConfig(format!("danger level {} is out of range 0-4", level))
            });
        }
        match normalized.as_str() {
            "none" => Ok(FaultSelector::None),
            "leak" | "leak-buffer" => Ok(FaultSelector::LeakBuffer),
            "double-release" | "double-free" => Ok(FaultSelector::DoubleRelease),
            "cycle" | "reference-cycle" => Ok(FaultSelector::ReferenceCycle),
            "dangling" | "dangling-reference" => Ok(FaultSelector::DanglingReference),
            other => Err(HarnessError::InvalidConfig(format!(
                "unknown fault selector '{}'",
                other
            ))),
        }
    }
}

/// Snapshot of manufactured defects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounts {
    pub leaked_buffers: u64,
    pub leaked_bytes: u64,
    pub double_releases: u64,
    pub reference_cycles: u64,
    pub dangling_references: u64,
    pub faulted_reads: u64,
}

#[derive(Default)]
struct FaultCounters {
    leaked_bytes: AtomicU64,
    double_releases: AtomicU64,
    reference_cycles: AtomicU64,
    dangling_references: AtomicU64,
    faulted_reads: AtomicU64,
}

#[derive(Default)]
struct CycleState {
    arena: NodeArena,
    holders: Option<(NodeId, NodeId)>,
}

/// Process-scoped fault state
pub struct FaultStore {
    heap: Arc<BufferHeap>,
    leaked: Mutex<Vec<BufferHandle>>,
    cycles: Mutex<CycleState>,
    counters: FaultCounters,
}

impl Default for FaultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultStore")
            .field("counts", &self.counts())
            .finish()
    }
}

impl FaultStore {
    /// An empty store over a fresh heap
    pub fn new() -> Self {
        Self::with_heap(Arc::new(BufferHeap::new()))
    }

    pub fn with_heap(heap: Arc<BufferHeap>) -> Self {
        Self {
            heap,
            leaked: Mutex::new(Vec::new()),
            cycles: Mutex::new(CycleState::default()),
            counters: FaultCounters::default(),
        }
    }

    pub fn heap(&self) -> &Arc<BufferHeap> {
        &self.heap
    }

    fn lock_cycles(&self) -> MutexGuard<'_, CycleState> {
        self.cycles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a buffer and keep it for the rest of the process
    pub fn leak_buffer(&self, size: usize) -> BufferHandle {
        let handle = self.heap.allocate_filled(size, LEAK_FILL);
        self.leaked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self.counters
            .leaked_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        debug!(%handle, size, "Leaked buffer");
        handle
    }

    /// Allocate a buffer, release it, then release the same token again
    ///
    /// Returns the fault reported by the second release.
    pub fn double_release(&self, size: usize) -> MemoryFault {
        let handle = self.heap.allocate_filled(size, DOUBLE_RELEASE_FILL);
        let first = self.heap.release(handle);
        debug_assert!(first.is_ok());

        let fault = match self.heap.release(handle) {
            Err(fault) => fault,
            // Unreachable with a correct heap; still report the attempt
            Ok(()) => MemoryFault::DoubleRelease { handle },
        };
        self.counters.double_releases.fetch_add(1, Ordering::Relaxed);
        debug!(%handle, "Released buffer twice");
        fault
    }

    /// Build two mutually owning nodes and make them the current holders
    ///
    /// The previous holder pair loses its external references but keeps
    /// owning itself, so it stays alive as an orphaned cycle.
    pub fn create_cycle(&self) -> (NodeId, NodeId) {
        let mut state = self.lock_cycles();
        let (a, b) = owning_pair(&mut state.arena);
        state.arena.hold(a);
        state.arena.hold(b);

        if let Some((old_a, old_b)) = state.holders.replace((a, b)) {
            state.arena.unhold(old_a);
            state.arena.unhold(old_b);
        }
        drop(state);

        self.counters.reference_cycles.fetch_add(1, Ordering::Relaxed);
        debug!(?a, ?b, "Created reference cycle");
        (a, b)
    }

    /// Build two mutually owning nodes with no external holder at all
    pub fn create_unheld_cycle(&self) -> (NodeId, NodeId) {
        let mut state = self.lock_cycles();
        owning_pair(&mut state.arena)
    }

    /// Release `raw` on the caller's behalf, leaving its token dangling
    pub fn dangle(&self, raw: &RawBuffer) {
        if let Err(fault) = raw.release() {
            debug!(%fault, "Response buffer was already released");
        }
        self.counters
            .dangling_references
            .fetch_add(1, Ordering::Relaxed);
        debug!(handle = %raw.handle(), "Response buffer left dangling");
    }

    /// Record a read through a released or bogus token
    pub fn record_faulted_read(&self, fault: &MemoryFault) {
        self.counters.faulted_reads.fetch_add(1, Ordering::Relaxed);
        debug!(%fault, "Faulted read recorded");
    }

    pub fn leaked_count(&self) -> usize {
        self.leaked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current process-wide cycle holders
    pub fn cycle_holders(&self) -> Option<(NodeId, NodeId)> {
        self.lock_cycles().holders
    }

    /// Run `f` against the cycle arena
    pub fn with_arena<R>(&self, f: impl FnOnce(&NodeArena) -> R) -> R {
        f(&self.lock_cycles().arena)
    }

    /// Nodes kept alive only by ownership cycles
    pub fn orphaned_cycle_nodes(&self) -> usize {
        self.lock_cycles().arena.orphaned().len()
    }

    pub fn counts(&self) -> FaultCounts {
        FaultCounts {
            leaked_buffers: self.leaked_count() as u64,
            leaked_bytes: self.counters.leaked_bytes.load(Ordering::Relaxed),
            double_releases: self.counters.double_releases.load(Ordering::Relaxed),
            reference_cycles: self.counters.reference_cycles.load(Ordering::Relaxed),
            dangling_references: self.counters.dangling_references.load(Ordering::Relaxed),
            faulted_reads: self.counters.faulted_reads.load(Ordering::Relaxed),
        }
    }
}

fn owning_pair(arena: &mut NodeArena) -> (NodeId, NodeId) {
    let a = arena.insert(1);
    let b = arena.insert(2);
    arena.link(a, b, EdgeKind::Owning);
    arena.link(b, a, EdgeKind::Owning);
    (a, b)
}

static FAULT_STORE: Lazy<Arc<FaultStore>> = Lazy::new(|| {
    let heap = BufferHeap::with_tracker(crate::diagnostics::global_memory_tracker().clone());
    Arc::new(FaultStore::with_heap(Arc::new(heap)))
});

/// Get the process-wide fault store
pub fn global_fault_store() -> Arc<FaultStore> {
    Arc::clone(&FAULT_STORE)
}
