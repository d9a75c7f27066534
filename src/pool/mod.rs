//! Fixed-size worker pool over a shared FIFO queue
//!
//! Workers are OS threads that pull boxed jobs from one mutex-guarded
//! `VecDeque` and sleep on a condition variable while it is empty. Each
//! submission returns a [`TaskHandle`] that resolves once the task has run.
//!
//! # Lifecycle
//!
//! `Running` → [`WorkerPool::shutdown`] → `Draining` → queue empty, workers
//! joined → `Stopped`. Submissions are accepted only while `Running`; every
//! job queued before the shutdown signal still runs.
//!
//! # Failure isolation
//!
//! A task that returns an error or panics is reported through its handle.
//! The worker that ran it keeps serving the queue.

pub mod handle;

pub use handle::{TaskFailure, TaskHandle, TaskOutcome};

use crate::error::{HarnessError, Result};
use handle::panic_message;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    /// Accepting and running work
    Running,

    /// Shutdown requested; finishing queued work
    Draining,

    /// All workers have exited
    Stopped,
}

/// Counters describing pool activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub queued: usize,
    pub state: PoolState,
}

struct Queue {
    jobs: VecDeque<Job>,
    state: PoolState,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    shared: Arc<Shared>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start a pool with `workers` threads
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(HarnessError::InvalidConfig(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let pool = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    state: PoolState::Running,
                }),
                available: Condvar::new(),
            }),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::with_capacity(workers)),
            size: workers,
        };

        for id in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("leakforge-worker-{}", id))
                .spawn(move || worker_loop(id, shared));

            match spawned {
                Ok(handle) => pool.lock_workers().push(handle),
                Err(e) => {
                    error!(worker = id, "Failed to spawn worker: {}", e);
                    pool.shutdown();
                    return Err(HarnessError::WorkerSpawn(e.to_string()));
                }
            }
        }

        debug!(workers, "Worker pool started");
        Ok(pool)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `task` and return a handle to its result
    ///
    /// Never blocks on the queue. Fails with [`HarnessError::PoolShutdown`]
    /// once shutdown has been requested.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let mut queue = self.shared.lock_queue();
        if queue.state != PoolState::Running {
            return Err(HarnessError::PoolShutdown);
        }

        let id = self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::clone(&self.counters);
        queue.jobs.push_back(Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskFailure::Failed(format!("{:#}", err))),
                Err(payload) => Err(TaskFailure::Panicked(panic_message(payload.as_ref()))),
            };

            if let Err(failure) = &outcome {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task = id, "{}", failure);
            }
            counters.completed.fetch_add(1, Ordering::Relaxed);

            // The caller may have dropped the handle
            let _ = sender.send(outcome);
        }));
        drop(queue);

        self.shared.available.notify_one();
        Ok(TaskHandle::new(id, receiver))
    }

    /// Stop accepting work, drain the queue and join every worker
    ///
    /// Safe to call more than once and from several threads. The first call
    /// joins the workers; concurrent callers block until the pool is stopped.
    pub fn shutdown(&self) {
        let joiner = {
            let mut queue = self.shared.lock_queue();
            if queue.state == PoolState::Running {
                queue.state = PoolState::Draining;
                info!(queued = queue.jobs.len(), "Worker pool draining");
                true
            } else {
                false
            }
        };
        self.shared.available.notify_all();

        if !joiner {
            let mut queue = self.shared.lock_queue();
            while queue.state != PoolState::Stopped {
                queue = self
                    .shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return;
        }

        let handles = std::mem::take(&mut *self.lock_workers());
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }

        self.shared.lock_queue().state = PoolState::Stopped;
        self.shared.available.notify_all();
        info!(
            completed = self.counters.completed.load(Ordering::Relaxed),
            failed = self.counters.failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
    }

    pub fn state(&self) -> PoolState {
        self.shared.lock_queue().state
    }

    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Number of tasks that have run to completion, successfully or not
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let queue = self.shared.lock_queue();
        PoolStats {
            workers: self.size,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queued: queue.jobs.len(),
            state: queue.state,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.lock_queue();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.state != PoolState::Running {
                    debug!(worker = id, "Worker exiting");
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| Ok(21 * 2)).unwrap();
        assert_eq!(handle.wait(), Ok(42));
        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_failed_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();

        let failing = pool
            .submit(|| -> anyhow::Result<()> { Err(anyhow::anyhow!("simulated failure")) })
            .unwrap();
        let panicking = pool
            .submit(|| -> anyhow::Result<()> { panic!("worker must survive this") })
            .unwrap();
        let after = pool.submit(|| Ok("still serving")).unwrap();

        assert_eq!(
            failing.wait(),
            Err(TaskFailure::Failed("simulated failure".to_string()))
        );
        assert_eq!(
            panicking.wait(),
            Err(TaskFailure::Panicked("worker must survive this".to_string()))
        );
        assert_eq!(after.wait(), Ok("still serving"));

        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn test_single_worker_runs_in_submission_order() {
        let pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();

        let result = pool.submit(|| Ok(()));
        assert!(matches!(result, Err(HarnessError::PoolShutdown)));
        assert_eq!(pool.stats().submitted, 0);
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            // Handles dropped on purpose; the work must still run
            let _ = pool
                .submit(move || {
                    thread::sleep(Duration::from_millis(2));
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(pool.completed(), 10);
        assert_eq!(pool.stats().queued, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(3).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Stopped);
        drop(pool);
    }

    #[test]
    fn test_concurrent_shutdown_waits_for_drain() {
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        for _ in 0..50 {
            let _ = pool
                .submit(|| {
                    thread::sleep(Duration::from_millis(1));
                    Ok(())
                })
                .unwrap();
        }

        let stoppers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    pool.shutdown();
                    (pool.state(), pool.completed())
                })
            })
            .collect();
        for stopper in stoppers {
            let (state, completed) = stopper.join().unwrap();
            assert_eq!(state, PoolState::Stopped);
            assert_eq!(completed, 50);
        }
    }

    #[test]
    fn test_late_shutdown_caller_blocks_until_stopped() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let _ = pool
            .submit(|| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();

        let first = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.shutdown())
        };
        // Let the first caller start joining
        while pool.state() == PoolState::Running {
            thread::sleep(Duration::from_millis(1));
        }

        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.completed(), 1);
        first.join().unwrap();
    }
}
