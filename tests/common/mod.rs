//! Common test utilities and helpers

#![allow(dead_code)]

use leakforge_core::{FaultPlan, FaultStore, HarnessConfig};
use std::sync::Arc;

/// Configuration with near-zero simulated latency
pub fn fast_config(calls: usize, workers: usize, plan: FaultPlan) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.workload.calls = calls;
    config.workload.workers = workers;
    config.workload.seed = Some(0x1eaf);
    config.simulator.min_latency_ms = 0;
    config.simulator.max_latency_ms = 2;
    config.faults = plan.to_settings();
    config
}

/// Fault store private to one test
pub fn isolated_store() -> Arc<FaultStore> {
    Arc::new(FaultStore::new())
}
