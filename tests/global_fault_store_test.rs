//! Process-wide fault state is never cleared

use leakforge_core::{global_fault_store, FaultPlan, FaultSelector, Harness, HarnessConfig};
use serial_test::serial;

fn leaking_config(calls: usize) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.workload.calls = calls;
    config.workload.workers = 4;
    config.simulator.min_latency_ms = 0;
    config.simulator.max_latency_ms = 1;
    config.faults = FaultPlan::Always(FaultSelector::LeakBuffer).to_settings();
    config
}

#[test]
#[serial]
fn test_leaks_persist_across_runs() {
    let store = global_fault_store();
    let before = store.counts();

    let first = Harness::new(leaking_config(5)).unwrap().run().unwrap();
    assert_eq!(first.faults.leaked_buffers, before.leaked_buffers + 5);

    let second = Harness::new(leaking_config(7)).unwrap().run().unwrap();
    assert_eq!(second.faults.leaked_buffers, before.leaked_buffers + 12);
    assert_eq!(store.leaked_count() as u64, before.leaked_buffers + 12);
}

#[test]
#[serial]
fn test_global_heap_reports_to_global_tracker() {
    let store = global_fault_store();
    let tracker = leakforge_core::diagnostics::global_memory_tracker();
    let before = tracker.snapshot();

    store.leak_buffer(1024);

    let after = tracker.snapshot();
    assert_eq!(after.allocation_count, before.allocation_count + 1);
    assert!(after.current_usage >= before.current_usage + 1024);
}
