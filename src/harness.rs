//! Workload driver
//!
//! Builds a [`WorkerPool`], a [`Simulator`] and a [`RetentionCache`], submits
//! one task per simulated call and waits for every handle before shutting the
//! pool down. Each task:
//!
//! 1. creates a payload and stores it in the cache (retaining every n-th
//!    payload forever)
//! 2. calls the simulator with the selector chosen by the [`FaultPlan`]
//! 3. copies the response buffer into a processing buffer; for a dangling
//!    response that read is itself a fault and is recorded
//! 4. releases the response buffer unless the simulator already did
//! 5. purges the cache on every n-th task

use crate::cache::{CacheStats, RetentionCache};
use crate::config::{FaultPlanKind, FaultSettings, HarnessConfig, WorkloadSettings};
use crate::diagnostics::MemorySnapshot;
use crate::error::{HarnessError, Result};
use crate::memory::HeapStats;
use crate::pool::{PoolStats, WorkerPool};
use crate::simulator::{global_fault_store, FaultCounts, FaultSelector, FaultStore, Simulator};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How fault selectors are assigned to call indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultPlan {
    /// Draw 0-10; 1-4 select a defect by danger level
    Random,
    /// No faults
    Off,
    /// Same selector on every call
    Always(FaultSelector),
    /// `selector` on the `every`-th, `2 * every`-th, ... call
    EveryNth { every: usize, selector: FaultSelector },
}

impl FaultPlan {
    /// Selector for the call at `index`
    pub fn select(&self, index: usize, rng: &mut impl Rng) -> FaultSelector {
        match *self {
            FaultPlan::Random => {
                let draw: u8 = rng.gen_range(0..=10);
                match draw {
                    1..=4 => FaultSelector::from_danger_level(draw).unwrap_or_default(),
                    _ => FaultSelector::None,
                }
            }
            FaultPlan::Off => FaultSelector::None,
            FaultPlan::Always(selector) => selector,
            FaultPlan::EveryNth { every, selector } => {
                if every > 0 && (index + 1) % every == 0 {
                    selector
                } else {
                    FaultSelector::None
                }
            }
        }
    }

    /// Build the plan described by validated settings
    pub fn from_settings(settings: &FaultSettings) -> Result<Self> {
        let selector = || {
            settings
                .selector
                .ok_or_else(|| HarnessError::InvalidConfig("fault plan needs a selector".to_string()))
        };
        Ok(match settings.plan {
            FaultPlanKind::Random => FaultPlan::Random,
            FaultPlanKind::None => FaultPlan::Off,
            FaultPlanKind::Always => FaultPlan::Always(selector()?),
            FaultPlanKind::EveryNth => FaultPlan::EveryNth {
                every: settings.every.unwrap_or(0),
                selector: selector()?,
            },
        })
    }

    /// Settings equivalent to this plan
    pub fn to_settings(&self) -> FaultSettings {
        match *self {
            FaultPlan::Random => FaultSettings {
                plan: FaultPlanKind::Random,
                ..Default::default()
            },
            FaultPlan::Off => FaultSettings {
                plan: FaultPlanKind::None,
                ..Default::default()
            },
            FaultPlan::Always(selector) => FaultSettings {
                plan: FaultPlanKind::Always,
                selector: Some(selector),
                every: None,
            },
            FaultPlan::EveryNth { every, selector } => FaultSettings {
                plan: FaultPlanKind::EveryNth,
                selector: Some(selector),
                every: Some(every),
            },
        }
    }
}

impl fmt::Display for FaultPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPlan::Random => write!(f, "random"),
            FaultPlan::Off => write!(f, "none"),
            FaultPlan::Always(selector) => write!(f, "always:{}", selector),
            FaultPlan::EveryNth { every, selector } => write!(f, "every:{}:{}", every, selector),
        }
    }
}

impl FromStr for FaultPlan {
    type Err = HarnessError;

    /// Accepts `random`, `none`, `always:<selector>` and `every:<n>:<selector>`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["random"] => Ok(FaultPlan::Random),
            ["none"] | ["off"] => Ok(FaultPlan::Off),
            ["always", selector] => Ok(FaultPlan::Always(selector.parse()?)),
            ["every", every, selector] => {
                let every: usize = every.parse().map_err(|_| {
                    HarnessError::InvalidConfig(format!("invalid interval '{}'", every))
                })?;
                if every == 0 {
                    return Err(HarnessError::InvalidConfig(
                        "fault interval must be at least 1".to_string(),
                    ));
                }
                Ok(FaultPlan::EveryNth {
                    every,
                    selector: selector.parse()?,
                })
            }
            _ => Err(HarnessError::InvalidConfig(format!(
                "unknown fault plan '{}'",
                s
            ))),
        }
    }
}

/// Outcome of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: FaultPlan,
    pub pool: PoolStats,
    pub task_failures: u64,
    pub faults: FaultCounts,
    pub cache: CacheStats,
    pub heap: HeapStats,
    pub memory: MemorySnapshot,
    pub orphaned_cycle_nodes: usize,
}

impl RunReport {
    pub fn submitted(&self) -> u64 {
        self.pool.submitted
    }

    pub fn completed(&self) -> u64 {
        self.pool.completed
    }

    /// Submitted and completed counts agree
    pub fn is_consistent(&self) -> bool {
        self.pool.submitted == self.pool.completed
    }

    pub fn summary(&self) -> String {
        let elapsed = self.finished_at - self.started_at;
        format!(
            "Run {} ({} ms, plan {})\n\
             - Calls: submitted {}, completed {}, failed {}\n\
             - Leaked buffers: {} ({} bytes)\n\
             - Double releases: {}\n\
             - Reference cycles: {} ({} orphaned nodes)\n\
             - Dangling references: {} ({} faulted reads)\n\
             - Cache: {} stored, {} retained ({} bytes), {} purged\n\
             {}",
            self.run_id,
            elapsed.num_milliseconds(),
            self.plan,
            self.pool.submitted,
            self.pool.completed,
            self.pool.failed,
            self.faults.leaked_buffers,
            self.faults.leaked_bytes,
            self.faults.double_releases,
            self.faults.reference_cycles,
            self.orphaned_cycle_nodes,
            self.faults.dangling_references,
            self.faults.faulted_reads,
            self.cache.stored,
            self.cache.retained,
            self.cache.retained_bytes,
            self.cache.purged,
            self.memory.to_human_readable(),
        )
    }
}

/// Everything a single call task needs, captured at submission
#[derive(Debug, Clone)]
struct CallTask {
    index: usize,
    endpoint: String,
    payload_size: usize,
    fault: FaultSelector,
}

/// What a call task hands back through its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub status: u16,
    pub fault: FaultSelector,
    pub faulted_read: bool,
}

struct TaskContext {
    simulator: Simulator,
    cache: RetentionCache,
    workload: WorkloadSettings,
    progress: AtomicUsize,
}

impl TaskContext {
    fn run(&self, task: CallTask) -> anyhow::Result<CallOutcome> {
        let result = self.execute(&task);

        let done = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
        if self.workload.progress_every > 0 && done % self.workload.progress_every == 0 {
            info!("[progress] completed {} calls", done);
        }
        result
    }

    fn execute(&self, task: &CallTask) -> anyhow::Result<CallOutcome> {
        let payload = Arc::new(vec![b'x'; task.payload_size]);
        self.cache
            .put(format!("{}:{}", task.endpoint, task.index), Arc::clone(&payload));
        if every(task.index, self.workload.retain_every) {
            self.cache.retain_forever(payload);
        }

        let response = self
            .simulator
            .call(&task.endpoint, task.payload_size, task.fault);

        let mut processing = vec![0u8; response.raw_size + 8];
        let faulted_read = match response.raw.copy_into(&mut processing) {
            Ok(_) => false,
            Err(fault) => {
                self.simulator.store().record_faulted_read(&fault);
                debug!(index = task.index, %fault, "Read through dangling response buffer");
                true
            }
        };
        drop(processing);

        if task.fault != FaultSelector::DanglingReference {
            response.raw.release()?;
        }

        if every(task.index, self.workload.purge_every) {
            self.cache.maybe_purge();
        }

        Ok(CallOutcome {
            status: response.status,
            fault: task.fault,
            faulted_read,
        })
    }
}

fn every(index: usize, n: usize) -> bool {
    n > 0 && index % n == 0
}

/// Workload driver
pub struct Harness {
    config: HarnessConfig,
    plan: FaultPlan,
    store: Arc<FaultStore>,
}

impl Harness {
    /// Driver over the process-wide fault store
    pub fn new(config: HarnessConfig) -> Result<Self> {
        Self::with_store(config, global_fault_store())
    }

    /// Driver over `store`
    pub fn with_store(config: HarnessConfig, store: Arc<FaultStore>) -> Result<Self> {
        config.validate()?;
        let plan = FaultPlan::from_settings(&config.faults)?;
        Ok(Self {
            config,
            plan,
            store,
        })
    }

    pub fn plan(&self) -> FaultPlan {
        self.plan
    }

    pub fn store(&self) -> &Arc<FaultStore> {
        &self.store
    }

    /// Run the workload to completion
    ///
    /// Blocks the calling thread until every task has finished.
    pub fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let workload = self.config.workload.clone();

        let mut rng = match workload.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let simulator = Simulator::with_store(
            self.config.simulator.clone(),
            Arc::clone(&self.store),
            workload.seed.map(|seed| seed.wrapping_add(1)),
        )?;
        let context = Arc::new(TaskContext {
            simulator,
            cache: RetentionCache::new(),
            workload: workload.clone(),
            progress: AtomicUsize::new(0),
        });

        info!(
            %run_id,
            plan = %self.plan,
            "Simulating {} API calls across {} worker threads",
            workload.calls,
            workload.workers
        );

        let pool = WorkerPool::new(workload.workers)?;
        let mut handles = Vec::with_capacity(workload.calls);
        for index in 0..workload.calls {
            let task = CallTask {
                index,
                endpoint: format!("/api/resource/{}", index % workload.endpoints),
                payload_size: rng.gen_range(workload.min_payload..=workload.max_payload),
                fault: self.plan.select(index, &mut rng),
            };
            let context = Arc::clone(&context);
            handles.push(pool.submit(move || context.run(task))?);
        }

        let mut task_failures = 0;
        for handle in handles {
            let id = handle.id();
            if let Err(failure) = handle.wait() {
                task_failures += 1;
                warn!(task = id, "{}", failure);
            }
        }

        pool.shutdown();
        let pool_stats = pool.stats();
        info!("All tasks finished: completed = {}", pool_stats.completed);
        if pool_stats.completed != pool_stats.submitted {
            warn!(
                submitted = pool_stats.submitted,
                completed = pool_stats.completed,
                "Worker pool lost tasks"
            );
        }

        // One last cycle that nothing outside it ever holds
        self.store.create_unheld_cycle();

        let cache = context.cache.stats();
        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            plan: self.plan,
            pool: pool_stats,
            task_failures,
            faults: self.store.counts(),
            cache,
            heap: self.store.heap().stats(),
            memory: self.store.heap().tracker().snapshot(),
            orphaned_cycle_nodes: self.store.orphaned_cycle_nodes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(calls: usize, plan: FaultPlan) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.workload.calls = calls;
        config.workload.workers = 4;
        config.workload.seed = Some(11);
        config.simulator.min_latency_ms = 0;
        config.simulator.max_latency_ms = 1;
        config.faults = plan.to_settings();
        config
    }

    #[test]
    fn test_plan_parsing() {
        assert_eq!("random".parse::<FaultPlan>().unwrap(), FaultPlan::Random);
        assert_eq!("none".parse::<FaultPlan>().unwrap(), FaultPlan::Off);
        assert_eq!(
            "always:cycle".parse::<FaultPlan>().unwrap(),
            FaultPlan::Always(FaultSelector::ReferenceCycle)
        );
        assert_eq!(
            "every:97:leak-buffer".parse::<FaultPlan>().unwrap(),
            FaultPlan::EveryNth {
                every: 97,
                selector: FaultSelector::LeakBuffer
            }
        );
        assert!("every:0:leak".parse::<FaultPlan>().is_err());
        assert!("sometimes".parse::<FaultPlan>().is_err());

        let plan = FaultPlan::EveryNth {
            every: 5,
            selector: FaultSelector::DoubleRelease,
        };
        assert_eq!(plan.to_string().parse::<FaultPlan>().unwrap(), plan);
        assert_eq!(FaultPlan::from_settings(&plan.to_settings()).unwrap(), plan);
    }

    #[test]
    fn test_random_plan_distribution() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = std::collections::HashSet::new();
        let mut none = 0;
        for i in 0..2000 {
            let selector = FaultPlan::Random.select(i, &mut rng);
            if selector == FaultSelector::None {
                none += 1;
            }
            seen.insert(selector);
        }
        assert_eq!(seen.len(), 5);
        // 7 of 11 draws map to no fault
        assert!(none > 1000 && none < 1500, "none = {}", none);
    }

    #[test]
    fn test_every_nth_plan() {
        let plan = FaultPlan::EveryNth {
            every: 97,
            selector: FaultSelector::LeakBuffer,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let hits: Vec<usize> = (0..1000)
            .filter(|&i| plan.select(i, &mut rng) == FaultSelector::LeakBuffer)
            .collect();
        assert_eq!(hits.len(), 10);
        // The 97th call is index 96; the first call never faults
        assert_eq!(hits.first(), Some(&96));
        assert_eq!(hits.last(), Some(&969));

        let every_call = FaultPlan::EveryNth {
            every: 1,
            selector: FaultSelector::DoubleRelease,
        };
        assert!((0..10).all(|i| every_call.select(i, &mut rng) == FaultSelector::DoubleRelease));
    }

    #[test]
    fn test_clean_run_releases_everything() {
        let store = Arc::new(FaultStore::new());
        let harness = Harness::with_store(quick_config(60, FaultPlan::Off), Arc::clone(&store)).unwrap();
        let report = harness.run().unwrap();

        assert!(report.is_consistent());
        assert_eq!(report.completed(), 60);
        assert_eq!(report.task_failures, 0);
        assert_eq!(report.heap.live, 0);
        assert_eq!(report.faults.leaked_buffers, 0);
        assert_eq!(report.faults.double_releases, 0);
        // Only the closing cycle is orphaned
        assert_eq!(report.orphaned_cycle_nodes, 2);
        // Indices 0 and 97.. retained: only index 0 below 60
        assert_eq!(report.cache.retained, 1);
    }

    #[test]
    fn test_dangling_run_records_faulted_reads() {
        let store = Arc::new(FaultStore::new());
        let harness = Harness::with_store(
            quick_config(20, FaultPlan::Always(FaultSelector::DanglingReference)),
            Arc::clone(&store),
        )
        .unwrap();
        let report = harness.run().unwrap();

        assert_eq!(report.completed(), 20);
        assert_eq!(report.task_failures, 0);
        assert_eq!(report.faults.dangling_references, 20);
        assert_eq!(report.faults.faulted_reads, 20);
        assert_eq!(report.heap.live, 0);
        assert_eq!(report.heap.double_releases, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = quick_config(10, FaultPlan::Off);
        config.workload.workers = 0;
        assert!(Harness::with_store(config, Arc::new(FaultStore::new())).is_err());
    }

    #[test]
    fn test_report_summary() {
        let store = Arc::new(FaultStore::new());
        let harness = Harness::with_store(
            quick_config(
                10,
                FaultPlan::Always(FaultSelector::LeakBuffer),
            ),
            store,
        )
        .unwrap();
        let report = harness.run().unwrap();

        let summary = report.summary();
        assert!(summary.contains("submitted 10, completed 10"));
        assert!(summary.contains("Leaked buffers: 10"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pool"]["completed"], 10);
        assert_eq!(json["faults"]["leaked_buffers"], 10);
    }
}
