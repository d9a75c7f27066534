//! Leakforge - Concurrent Workload Harness with Fault Injection
//!
//! Drives a batch of simulated API calls through a fixed-size worker pool and
//! lets each call manufacture one class of memory defect on purpose:
//! - Leaked buffers that nothing ever releases
//! - Buffers released twice
//! - Pairs of nodes that own each other
//! - Response buffers released before the caller reads them
//!
//! # Architecture
//!
//! - **Pool**: FIFO worker pool with awaitable task handles and a draining shutdown
//! - **Memory**: Generation-checked simulated heap and a node arena for cycles
//! - **Simulator**: Latency, status and body generation plus fault injection
//! - **Cache**: Payload cache with bounded purges and a permanent retention list
//! - **Harness**: Workload driver tying the above together
//!
//! # Example
//!
//! ```ignore
//! use leakforge_core::{Harness, HarnessConfig};
//!
//! fn main() -> leakforge_core::Result<()> {
//!     let config = HarnessConfig::from_file("leakforge.toml".as_ref())?;
//!     let report = Harness::new(config)?.run()?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod harness;
pub mod memory;
pub mod pool;
pub mod simulator;

// Re-export commonly used types
pub use cache::{CacheStats, RetentionCache, SharedBuffer};
pub use config::{
    FaultPlanKind, FaultSettings, HarnessConfig, MonitoringSettings, SimulatorSettings,
    WorkloadSettings,
};
pub use error::{HarnessError, Result};
pub use harness::{CallOutcome, FaultPlan, Harness, RunReport};
pub use memory::{BufferHandle, BufferHeap, MemoryFault, RawBuffer};
pub use pool::{PoolState, PoolStats, TaskFailure, TaskHandle, TaskOutcome, WorkerPool};
pub use simulator::{
    global_fault_store, FaultCounts, FaultSelector, FaultStore, SimulatedResponse, Simulator,
};
