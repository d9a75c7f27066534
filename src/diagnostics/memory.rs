//! Memory accounting for simulated buffers
//!
//! Every allocation and release performed through the buffer heap is
//! reported here, so a run can be compared against what an external leak
//! detector observes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default budget used for threshold classification (256 MB)
const DEFAULT_BUDGET_BYTES: u64 = 256 * 1_048_576;

/// Memory statistics tracker (thread-safe)
#[derive(Clone)]
pub struct MemoryTracker {
    /// Total bytes allocated (cumulative)
    pub total_allocated: Arc<AtomicU64>,

    /// Current bytes in use
    pub current_usage: Arc<AtomicU64>,

    /// Peak memory usage
    pub peak_usage: Arc<AtomicU64>,

    /// Number of live allocations
    pub allocation_count: Arc<AtomicUsize>,

    /// Number of successful releases
    pub release_count: Arc<AtomicUsize>,

    /// Bytes a run is expected to stay under
    budget_bytes: u64,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_BUDGET_BYTES)
    }

    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            total_allocated: Arc::new(AtomicU64::new(0)),
            current_usage: Arc::new(AtomicU64::new(0)),
            peak_usage: Arc::new(AtomicU64::new(0)),
            allocation_count: Arc::new(AtomicUsize::new(0)),
            release_count: Arc::new(AtomicUsize::new(0)),
            budget_bytes: budget_bytes.max(1),
        }
    }

    /// Record an allocation
    pub fn record_allocation(&self, bytes: u64) {
        self.total_allocated.fetch_add(bytes, Ordering::Relaxed);
        let current = self.current_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        // Update peak if needed
        let mut peak = self.peak_usage.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_usage.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    /// Record a release
    pub fn record_deallocation(&self, bytes: u64) {
        self.current_usage.fetch_sub(bytes, Ordering::Relaxed);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.release_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            current_usage: self.current_usage.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            release_count: self.release_count.load(Ordering::Relaxed),
        }
    }

    /// Log current memory statistics
    pub fn log_statistics(&self) {
        let snapshot = self.snapshot();
        info!(
            current_kb = snapshot.current_usage / 1024,
            peak_kb = snapshot.peak_usage / 1024,
            total_kb = snapshot.total_allocated / 1024,
            live = snapshot.allocation_count,
            released = snapshot.release_count,
            "Memory statistics"
        );
    }

    /// Classify current usage against the configured budget
    pub fn check_thresholds(&self) -> MemoryStatus {
        let snapshot = self.snapshot();
        let usage_pct = (snapshot.current_usage as f64 / self.budget_bytes as f64) * 100.0;

        if usage_pct > 80.0 {
            warn!(
                usage_pct = format!("{:.1}%", usage_pct),
                current_bytes = snapshot.current_usage,
                budget_bytes = self.budget_bytes,
                "Simulated memory usage critical"
            );
            MemoryStatus::Critical
        } else if usage_pct > 60.0 {
            warn!(
                usage_pct = format!("{:.1}%", usage_pct),
                current_bytes = snapshot.current_usage,
                "Simulated memory usage high"
            );
            MemoryStatus::High
        } else if usage_pct > 40.0 {
            debug!(
                usage_pct = format!("{:.1}%", usage_pct),
                "Simulated memory usage moderate"
            );
            MemoryStatus::Moderate
        } else {
            MemoryStatus::Normal
        }
    }
}

/// Memory statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_allocated: u64,
    pub current_usage: u64,
    pub peak_usage: u64,
    pub allocation_count: usize,
    pub release_count: usize,
}

impl MemorySnapshot {
    /// Convert to human-readable format
    pub fn to_human_readable(&self) -> String {
        format!(
            "Simulated heap:\n\
             - Current: {:.2} KB\n\
             - Peak: {:.2} KB\n\
             - Total Allocated: {:.2} KB\n\
             - Live Allocations: {}\n\
             - Releases: {}",
            self.current_usage as f64 / 1024.0,
            self.peak_usage as f64 / 1024.0,
            self.total_allocated as f64 / 1024.0,
            self.allocation_count,
            self.release_count,
        )
    }
}

/// Memory usage status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Normal,    // < 40%
    Moderate,  // 40-60%
    High,      // 60-80%
    Critical,  // > 80%
}

/// Global memory tracker instance
static MEMORY_TRACKER: once_cell::sync::Lazy<MemoryTracker> =
    once_cell::sync::Lazy::new(MemoryTracker::new);

/// Get the global memory tracker
pub fn global_memory_tracker() -> &'static MemoryTracker {
    &MEMORY_TRACKER
}

/// Start periodic memory monitoring for `tracker`
pub fn start_memory_monitoring(
    tracker: MemoryTracker,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            tracker.log_statistics();
            if tracker.check_thresholds() == MemoryStatus::Critical {
                warn!("CRITICAL: simulated heap is close to its budget");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tracker_allocation() {
        let tracker = MemoryTracker::new();

        tracker.record_allocation(1024);
        assert_eq!(tracker.current_usage.load(Ordering::Relaxed), 1024);
        assert_eq!(tracker.allocation_count.load(Ordering::Relaxed), 1);

        tracker.record_deallocation(1024);
        assert_eq!(tracker.current_usage.load(Ordering::Relaxed), 0);
        assert_eq!(tracker.allocation_count.load(Ordering::Relaxed), 0);
        assert_eq!(tracker.release_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_memory_tracker_peak() {
        let tracker = MemoryTracker::new();

        tracker.record_allocation(1000);
        tracker.record_allocation(2000);
        assert_eq!(tracker.peak_usage.load(Ordering::Relaxed), 3000);

        tracker.record_deallocation(2000);
        assert_eq!(tracker.peak_usage.load(Ordering::Relaxed), 3000); // Peak unchanged
    }

    #[test]
    fn test_thresholds() {
        let tracker = MemoryTracker::with_budget(1000);
        assert_eq!(tracker.check_thresholds(), MemoryStatus::Normal);

        tracker.record_allocation(500);
        assert_eq!(tracker.check_thresholds(), MemoryStatus::Moderate);

        tracker.record_allocation(400);
        assert_eq!(tracker.check_thresholds(), MemoryStatus::Critical);
    }

    #[test]
    fn test_human_readable() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(2048);
        let text = tracker.snapshot().to_human_readable();
        assert!(text.contains("Current: 2.00 KB"));
        assert!(text.contains("Live Allocations: 1"));
    }
}
