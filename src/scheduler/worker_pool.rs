//! Bounded worker pool for executing one phase of stale tasks.
//!
//! Jobs are pushed onto a shared queue and pulled by a fixed number of
//! workers. Each task runs inside its own spawned task, so a panic is caught
//! at the join handle and recorded as that task's failure. Results come back
//! over a channel and are returned in submission order.
//!
//! A phase is drained completely before `run_phase` returns; the coordinator
//! relies on this to keep ensemble tasks behind their model tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cancel::{CancelSignal, Interrupted};
use crate::executor::{ExecutionResult, TaskExecutor, TaskOutcome};
use crate::graph::TaskSpec;
use crate::metrics::MetricsCollector;

/// Errors that can occur when building the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool needs at least one worker.
    #[error("Invalid worker count {0}: at least one worker is required")]
    InvalidWorkerCount(usize),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { num_workers: 1 }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers }
    }
}

/// Statistics about the worker pool, accumulated over its lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a task.
    pub active_workers: usize,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_deferred: u64,
    /// Average task duration over succeeded and failed tasks.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the number of tasks that ran to an outcome other than deferral.
    pub fn total_executed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_executed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_deferred: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_deferred: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: TaskOutcome, duration: Duration) {
        let counter = match outcome {
            TaskOutcome::Succeeded => &self.tasks_succeeded,
            TaskOutcome::Failed => &self.tasks_failed,
            TaskOutcome::Deferred => {
                self.tasks_deferred.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.tasks_succeeded.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let executed = succeeded + failed;
        let average = if executed > 0 {
            Duration::from_millis(total_duration_ms / executed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            tasks_deferred: self.tasks_deferred.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

type JobQueue = Arc<Mutex<mpsc::Receiver<(usize, TaskSpec)>>>;
type ResultSender = mpsc::UnboundedSender<(usize, Result<ExecutionResult, Interrupted>)>;

/// Fixed-size pool of workers sharing one task executor.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: Arc<TaskExecutor>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidWorkerCount` for a pool of zero workers.
    pub fn new(config: WorkerPoolConfig, executor: Arc<TaskExecutor>) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::InvalidWorkerCount(0));
        }
        Ok(Self {
            config,
            executor,
            stats: Arc::new(SharedPoolStats::new()),
        })
    }

    /// Executes every task of one phase and waits for all of them.
    ///
    /// Returns results in the order the tasks were given. Tasks not yet
    /// started when cancellation is observed are dropped, and the whole
    /// phase reports `Interrupted`.
    pub async fn run_phase(
        &self,
        tasks: Vec<TaskSpec>,
        cancel: &CancelSignal,
    ) -> Result<Vec<ExecutionResult>, Interrupted> {
        cancel.check()?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let total = tasks.len();
        let (job_tx, job_rx) = mpsc::channel(total);
        for job in tasks.into_iter().enumerate() {
            // Capacity equals the task count, so this never waits.
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let queue: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        let num_workers = self.config.num_workers.min(total);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&queue),
                executor: Arc::clone(&self.executor),
                results: result_tx.clone(),
                cancel: cancel.clone(),
                stats: Arc::clone(&self.stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(result_tx);
        debug!(tasks = total, workers = num_workers, "Phase dispatched");

        let mut results = Vec::with_capacity(total);
        let mut interrupted = false;
        while let Some((index, result)) = result_rx.recv().await {
            match result {
                Ok(result) => results.push((index, result)),
                Err(Interrupted) => interrupted = true,
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        if interrupted || cancel.is_cancelled() {
            warn!(
                completed = results.len(),
                total = total,
                "Phase interrupted"
            );
            return Err(Interrupted);
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }
}

/// A single worker pulling tasks from the phase queue.
struct Worker {
    id: String,
    queue: JobQueue,
    executor: Arc<TaskExecutor>,
    results: ResultSender,
    cancel: CancelSignal,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker_id = %self.id, "Worker observed cancellation");
                break;
            }

            let next = self.queue.lock().await.recv().await;
            let Some((index, task)) = next else {
                break;
            };

            let result = self.process(task).await;
            let stop = result.is_err();
            if self.results.send((index, result)).is_err() || stop {
                break;
            }
        }
    }

    async fn process(&self, task: TaskSpec) -> Result<ExecutionResult, Interrupted> {
        let active = self.stats.increment_active();
        MetricsCollector::new().set_active_workers(active);
        let start = Instant::now();

        info!(worker_id = %self.id, task = %task.key, "Executing task");

        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        let spec = task.clone();
        let handle = tokio::spawn(async move { executor.run(&spec, &cancel).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let detail = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                error!(worker_id = %self.id, task = %task.key, error = %detail, "Task crashed");
                Ok(self
                    .executor
                    .record_crash(&task, format!("task crashed: {}", detail), start.elapsed())
                    .await)
            }
        };

        let active = self.stats.decrement_active();
        MetricsCollector::new().set_active_workers(active);

        if let Ok(result) = &result {
            self.stats.record(result.outcome, result.duration);
        }
        result
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
