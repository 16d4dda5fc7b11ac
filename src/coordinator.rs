//! Run coordinator: one discovery, build and execute pass per cycle.
//!
//! ```text
//! Idle -> Discovering -> Building -> Executing -> Idle
//! ```
//!
//! A cycle succeeds once every phase has been drained, whatever the outcome
//! of individual tasks. `run_forever` repeats cycles until cancelled; an
//! error or panic inside a cycle only delays the next one.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{ConfigError, ForgeConfig};
use crate::executor::{
    ArtifactLayout, CommandRunner, ExecutionResult, FileTracker, TaskExecutor, TaskOutcome,
};
use crate::graph::{SkippedComponent, TaskGraph, TaskGraphBuilder, TaskKey};
use crate::history::{Axis, HistoryError, HistoryStore};
use crate::metrics::{write_textfile, MetricsCollector};
use crate::registry::{
    ComponentKind, DefaultSync, Discovery, DiscoveryError, GitSync, PipelineRegistry,
};
use crate::scheduler::worker_pool::panic_message;
use crate::scheduler::{
    CancelSignal, Interrupted, PoolError, PoolStats, WorkerPool, WorkerPoolConfig,
};

/// Where the coordinator is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Discovering,
    Building,
    Executing,
}

/// Errors that end a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Cycle cancelled by operator")]
    Cancelled,

    #[error("History store error: {0}")]
    History(#[from] HistoryError),

    #[error("Discovery failed: {0}")]
    Discovery(DiscoveryError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<Interrupted> for CycleError {
    fn from(_: Interrupted) -> Self {
        CycleError::Cancelled
    }
}

impl From<DiscoveryError> for CycleError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Cancelled => CycleError::Cancelled,
            other => CycleError::Discovery(other),
        }
    }
}

/// A pipeline left out of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedPipeline {
    pub locator: String,
    pub reason: String,
}

/// One stale task as planned, before execution.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub key: TaskKey,
    pub kind: ComponentKind,
    pub stale_axes: Vec<Axis>,
    pub outputs_missing: bool,
    pub dependencies: usize,
    pub artifact_dir: PathBuf,
}

/// What the next cycle would execute.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub considered: usize,
    pub tasks: Vec<PlannedTask>,
    pub skipped: Vec<SkippedComponent>,
    pub excluded: Vec<ExcludedPipeline>,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pipelines: usize,
    pub considered: usize,
    /// Tasks found stale when the graph was built.
    pub stale: usize,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: Vec<SkippedComponent>,
    pub excluded: Vec<ExcludedPipeline>,
    pub results: Vec<ExecutionResult>,
    /// Worker pool totals since the coordinator was created.
    pub pool: PoolStats,
}

impl CycleReport {
    fn new(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            pipelines: 0,
            considered: 0,
            stale: 0,
            executed: 0,
            succeeded: 0,
            failed: 0,
            deferred: 0,
            skipped: Vec::new(),
            excluded: Vec::new(),
            results: Vec::new(),
            pool: PoolStats::default(),
        }
    }

    fn record(&mut self, result: ExecutionResult) {
        match result.outcome {
            TaskOutcome::Succeeded => {
                self.executed += 1;
                self.succeeded += 1;
            }
            TaskOutcome::Failed => {
                self.executed += 1;
                self.failed += 1;
            }
            TaskOutcome::Deferred => self.deferred += 1,
        }
        self.results.push(result);
    }

    /// Keys of the tasks that actually ran (succeeded or failed).
    pub fn executed_keys(&self) -> Vec<&TaskKey> {
        self.results
            .iter()
            .filter(|r| r.outcome != TaskOutcome::Deferred)
            .map(|r| &r.key)
            .collect()
    }
}

/// Drives scheduling cycles end to end.
pub struct RunCoordinator {
    registry: PipelineRegistry,
    builder: TaskGraphBuilder,
    pool: WorkerPool,
    layout: ArtifactLayout,
    cancel: CancelSignal,
    state: watch::Sender<CycleState>,
    metrics: MetricsCollector,
}

impl RunCoordinator {
    pub fn new(
        registry: PipelineRegistry,
        builder: TaskGraphBuilder,
        pool: WorkerPool,
        layout: ArtifactLayout,
        cancel: CancelSignal,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            registry,
            builder,
            pool,
            layout,
            cancel,
            state,
            metrics: MetricsCollector::new(),
        }
    }

    /// Wires the default collaborators from configuration.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the history store cannot
    /// be opened.
    pub async fn from_config(config: &ForgeConfig, cancel: CancelSignal) -> Result<Self, CycleError> {
        config.validate()?;

        let history = HistoryStore::open(&config.history_path, config.history_scope.clone()).await?;
        let layout = ArtifactLayout::new(&config.artifacts_dir);

        let git = GitSync::new(&config.checkout_dir).with_refresh(config.refresh_sources);
        let registry = PipelineRegistry::new(&config.sources_file, Arc::new(DefaultSync::new(git)));

        let builder = TaskGraphBuilder::new(
            history.clone(),
            layout.clone(),
            &config.datasets_dir,
            config.stages.clone(),
        );

        let runner = Arc::new(CommandRunner::new());
        let executor = TaskExecutor::new(
            history,
            runner.clone(),
            runner,
            Arc::new(FileTracker::new(&config.tracking_dir)),
        )
        .with_task_timeout(config.task_timeout);
        let pool = WorkerPool::new(WorkerPoolConfig::new(config.workers), Arc::new(executor))?;

        Ok(Self::new(registry, builder, pool, layout, cancel))
    }

    /// Observes the coordinator's state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CycleState) {
        self.state.send_replace(state);
        tracing::debug!(state = ?state, "Coordinator state changed");
    }

    /// Discovers pipelines and builds the stale task list without executing.
    pub async fn plan(&self) -> Result<Plan, CycleError> {
        let result = self.discover_and_build().await;
        self.set_state(CycleState::Idle);
        let (discovery, graph) = result?;

        Ok(Plan {
            considered: graph.considered,
            tasks: graph
                .tasks
                .iter()
                .map(|t| PlannedTask {
                    key: t.key.clone(),
                    kind: t.kind,
                    stale_axes: t.stale_axes.clone(),
                    outputs_missing: t.outputs_missing,
                    dependencies: t.dependencies.len(),
                    artifact_dir: t.artifact_dir.clone(),
                })
                .collect(),
            skipped: graph.skipped,
            excluded: excluded(&discovery),
        })
    }

    /// Executes one discovery, build and execute cycle.
    ///
    /// Task failures are reported in the returned `CycleReport`; only
    /// cancellation and cycle-level failures (history store, source list)
    /// produce an error.
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        let cycle_id = Uuid::new_v4();
        let mut report = CycleReport::new(cycle_id, Utc::now());
        tracing::info!(cycle_id = %cycle_id, "Cycle started");

        let result = self.cycle(&mut report).await;
        self.set_state(CycleState::Idle);
        report.finished_at = Utc::now();
        report.pool = self.pool.stats();

        let status = match &result {
            Ok(()) => "success",
            Err(CycleError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        self.metrics
            .record_cycle(status, report.stale, report.excluded.len());
        if let Err(e) = write_textfile(&self.layout.metrics_path()) {
            tracing::warn!(error = %e, "Failed to write metrics file");
        }

        result?;
        tracing::info!(
            cycle_id = %cycle_id,
            pipelines = report.pipelines,
            executed = report.executed,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped.len(),
            excluded = report.excluded.len(),
            total_succeeded = report.pool.tasks_succeeded,
            total_failed = report.pool.tasks_failed,
            success_rate = report.pool.success_rate(),
            avg_task_ms = report.pool.average_task_duration.as_millis() as u64,
            "Cycle finished"
        );
        Ok(report)
    }

    async fn cycle(&self, report: &mut CycleReport) -> Result<(), CycleError> {
        let (discovery, mut graph) = self.discover_and_build().await?;
        report.pipelines = discovery.pipelines.len();
        report.excluded = excluded(&discovery);
        report.considered = graph.considered;

        report.stale = graph.len();
        report.skipped = std::mem::take(&mut graph.skipped);

        self.set_state(CycleState::Executing);
        for (phase, tasks) in graph.into_phases() {
            if tasks.is_empty() {
                continue;
            }
            tracing::info!(phase = %phase, tasks = tasks.len(), "Executing phase");
            let results = self.pool.run_phase(tasks, &self.cancel).await?;
            for result in results {
                report.record(result);
            }
        }
        Ok(())
    }

    async fn discover_and_build(&self) -> Result<(Discovery, TaskGraph), CycleError> {
        self.cancel.check()?;
        self.set_state(CycleState::Discovering);
        let discovery = self.registry.discover(&self.cancel).await?;

        self.cancel.check()?;
        self.set_state(CycleState::Building);
        let graph = self.builder.build_stale_tasks(&discovery.pipelines).await?;
        Ok((discovery, graph))
    }

    /// Runs cycles until cancelled.
    ///
    /// Waits `idle` after a successful cycle and `backoff` after a failed
    /// or panicked one. Both waits end early on cancellation. Always
    /// returns `CycleError::Cancelled`.
    pub async fn run_forever(&self, idle: Duration, backoff: Duration) -> Result<(), CycleError> {
        loop {
            let delay = match AssertUnwindSafe(self.run_once()).catch_unwind().await {
                Ok(Ok(_)) => idle,
                Ok(Err(CycleError::Cancelled)) => return Err(CycleError::Cancelled),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Cycle failed, retrying");
                    backoff
                }
                Err(panic) => {
                    tracing::error!(panic = %panic_message(panic), "Cycle panicked, retrying");
                    self.set_state(CycleState::Idle);
                    backoff
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn excluded(discovery: &Discovery) -> Vec<ExcludedPipeline> {
    discovery
        .failures
        .iter()
        .map(|f| ExcludedPipeline {
            locator: f.locator.clone(),
            reason: f.error.to_string(),
        })
        .collect()
}
