//! Task execution.
//!
//! `TaskExecutor::run` takes one stale task through its steps:
//!
//! 1. Create the fingerprint-namespaced artifact directory
//! 2. Gather the upstream artifacts it consumes (missing ones defer the task)
//! 3. Invoke the stage runner
//! 4. Persist metrics, predictions and trained state
//! 5. Report to experiment tracking and render visualizers
//! 6. Record every fingerprint axis in history, then mark the directory ready
//!
//! Any failure leaves history untouched and writes `error.txt` into the
//! artifact directory. Dependents only consume directories carrying the
//! success marker, so outputs of a run that failed after persisting them are
//! never picked up. Cancellation is not a failure: it returns
//! `Interrupted` and leaves no trace.

pub mod artifacts;
pub mod runner;
pub mod tracking;

pub use artifacts::ArtifactLayout;
pub use runner::{
    CommandRunner, StageInputs, StageOutput, StageRunner, UpstreamArtifact, VisualContext,
    Visualizer,
};
pub use tracking::{
    ExperimentTracker, FileTracker, NullTracker, RunRecord, RunStatus, TrackedRun, TrackingError,
};

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::error::{ExecutionError, PersistenceError};
use crate::graph::{DependencyKind, Stage, TaskKey, TaskSpec};
use crate::history::HistoryStore;
use crate::metrics::MetricsCollector;
use crate::registry::ComponentKind;
use crate::scheduler::{CancelSignal, Interrupted};

/// Final outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    /// Upstream artifacts were missing; the task stays stale.
    Deferred,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Succeeded => write!(f, "succeeded"),
            TaskOutcome::Failed => write!(f, "failed"),
            TaskOutcome::Deferred => write!(f, "deferred"),
        }
    }
}

/// Result of executing a single task.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub key: TaskKey,
    pub kind: ComponentKind,
    pub outcome: TaskOutcome,
    pub metrics: BTreeMap<String, f64>,
    pub artifact_dir: PathBuf,
    /// Failure diagnostic, or the reason a task was deferred.
    pub error_detail: Option<String>,
    pub duration: Duration,
}

/// Why a task could not produce a result. Everything here is a task failure.
#[derive(Debug, Error)]
enum StepError {
    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Experiment tracking failed: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Visualizer '{name}' failed: {source}")]
    Visualizer {
        name: String,
        #[source]
        source: ExecutionError,
    },
}

/// Runs stale tasks against the configured collaborators.
pub struct TaskExecutor {
    history: HistoryStore,
    runner: Arc<dyn StageRunner>,
    visualizer: Arc<dyn Visualizer>,
    tracker: Arc<dyn ExperimentTracker>,
    task_timeout: Option<Duration>,
    metrics: MetricsCollector,
}

impl TaskExecutor {
    pub fn new(
        history: HistoryStore,
        runner: Arc<dyn StageRunner>,
        visualizer: Arc<dyn Visualizer>,
        tracker: Arc<dyn ExperimentTracker>,
    ) -> Self {
        Self {
            history,
            runner,
            visualizer,
            tracker,
            task_timeout: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Fails any stage call that runs longer than `timeout`.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Executes one task.
    ///
    /// Returns `Err(Interrupted)` only for cancellation. Every other problem
    /// is contained in the returned `ExecutionResult`.
    pub async fn run(&self, task: &TaskSpec, cancel: &CancelSignal) -> Result<ExecutionResult, Interrupted> {
        let start = Instant::now();
        cancel.check()?;

        let prepared = match artifacts::ensure_dir(&task.artifact_dir).await {
            Ok(()) => artifacts::clear_success(&task.artifact_dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            return Ok(self.fail(task, &StepError::from(e), start.elapsed()).await);
        }

        let upstream = match self.gather_upstream(task).await {
            Ok(Gathered::Ready(upstream)) => upstream,
            Ok(Gathered::Missing(missing)) => return Ok(self.defer(task, missing, start.elapsed())),
            Err(e) => return Ok(self.fail(task, &StepError::from(e), start.elapsed()).await),
        };

        let run_name = format!("{}_{}", task.key.stage, task.key.component);
        let mut run = match self
            .tracker
            .begin_run(&task.pipeline.name, &run_name, task.revision.as_str())
            .await
        {
            Ok(run) => run,
            Err(e) => return Ok(self.fail(task, &StepError::from(e), start.elapsed()).await),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.execute_steps(task, upstream, run.as_mut()) => Some(r),
        };

        match outcome {
            None => {
                if let Err(e) = run.end(RunStatus::Failed).await {
                    tracing::warn!(task = %task.key, error = %e, "Failed to close interrupted run");
                }
                let _ = tokio::fs::remove_dir_all(task.artifact_dir.join(artifacts::OUTPUT_DIR)).await;
                tracing::warn!(task = %task.key, "Task interrupted");
                Err(Interrupted)
            }
            Some(Ok(metrics)) => match run.end(RunStatus::Success).await {
                Ok(()) => Ok(self.succeed(task, metrics, start.elapsed()).await),
                Err(e) => Ok(self.fail(task, &StepError::from(e), start.elapsed()).await),
            },
            Some(Err(e)) => {
                if let Err(end_err) = run.end(RunStatus::Failed).await {
                    tracing::warn!(task = %task.key, error = %end_err, "Failed to close tracked run");
                }
                Ok(self.fail(task, &e, start.elapsed()).await)
            }
        }
    }

    /// Stage call, persistence and tracking. History is written by the caller.
    async fn execute_steps(
        &self,
        task: &TaskSpec,
        upstream: Upstream,
        run: &mut dyn TrackedRun,
    ) -> Result<BTreeMap<String, f64>, StepError> {
        let output_dir = task.artifact_dir.join(artifacts::OUTPUT_DIR);
        let inputs = StageInputs {
            key: task.key.clone(),
            stage: task.key.stage,
            pipeline_root: task.pipeline.local_path.clone(),
            interpreter: task.interpreter.clone(),
            component: task.component.clone(),
            dataset_dir: task.dataset_dir.clone(),
            output_dir: output_dir.clone(),
            state_dir: task.artifact_dir.join(artifacts::STATE_DIR),
            trained_state_dir: upstream.trained_state_dir,
            upstream: upstream.models,
        };

        run.set_tag("INTERPRETER", &task.key.interpreter).await?;
        run.set_tag("DATASET", &task.key.dataset).await?;

        let call = async {
            match task.key.stage {
                Stage::Train => self.runner.train(&inputs).await,
                Stage::Test => self.runner.evaluate(&inputs).await,
            }
        };
        let output = match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ExecutionError::Timeout(limit))),
            None => call.await,
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&output_dir).await;
                return Err(e.into());
            }
        };

        artifacts::write_json(&task.artifact_dir.join(artifacts::RESULTS_FILE), &output.metrics)
            .await?;
        artifacts::write_json(
            &task.artifact_dir.join(artifacts::PREDICTIONS_FILE),
            &output.predictions,
        )
        .await?;
        let _ = tokio::fs::remove_dir_all(&output_dir).await;

        for (name, value) in &output.metrics {
            run.log_metric(name, *value).await?;
        }

        for visualizer in &task.pipeline.visualizers {
            let ctx = VisualContext {
                key: task.key.clone(),
                pipeline_root: task.pipeline.local_path.clone(),
                visualizer: visualizer.clone(),
                dataset_dir: task.dataset_dir.clone(),
                artifact_dir: task.artifact_dir.clone(),
                output_dir: task
                    .artifact_dir
                    .join("visualizations")
                    .join(artifacts::sanitize_segment(&visualizer.name)),
            };
            let rendered = self
                .visualizer
                .render(&ctx)
                .await
                .map_err(|source| StepError::Visualizer {
                    name: visualizer.name.clone(),
                    source,
                })?;
            run.log_artifacts(&rendered).await?;
        }

        Ok(output.metrics)
    }

    async fn gather_upstream(&self, task: &TaskSpec) -> Result<Gathered, PersistenceError> {
        let mut missing = Vec::new();
        for dep in &task.dependencies {
            if !artifacts::is_complete(&dep.artifact_dir).await {
                missing.push(format!("{} ({})", dep.component, dep.artifact_dir.display()));
            }
        }
        if !missing.is_empty() {
            return Ok(Gathered::Missing(missing));
        }

        let mut upstream = Upstream::default();
        for dep in &task.dependencies {
            match dep.kind {
                DependencyKind::TrainedState => {
                    upstream.trained_state_dir = Some(dep.artifact_dir.join(artifacts::STATE_DIR));
                }
                DependencyKind::ModelOutput => {
                    let metrics =
                        artifacts::read_json(&dep.artifact_dir.join(artifacts::RESULTS_FILE)).await?;
                    let predictions =
                        artifacts::read_json(&dep.artifact_dir.join(artifacts::PREDICTIONS_FILE))
                            .await?;
                    upstream.models.push(UpstreamArtifact {
                        component: dep.component.clone(),
                        artifact_dir: dep.artifact_dir.clone(),
                        metrics,
                        predictions,
                    });
                }
            }
        }
        Ok(Gathered::Ready(upstream))
    }

    async fn succeed(
        &self,
        task: &TaskSpec,
        metrics: BTreeMap<String, f64>,
        duration: Duration,
    ) -> ExecutionResult {
        if let Err(e) = self.history.set_all(&task.key, &task.fingerprints()).await {
            return self
                .fail(task, &StepError::Persistence(PersistenceError::History(e)), duration)
                .await;
        }
        if let Err(e) = artifacts::mark_success(&task.artifact_dir).await {
            return self.fail(task, &StepError::from(e), duration).await;
        }
        if let Err(e) = artifacts::clear_error(&task.artifact_dir).await {
            tracing::warn!(task = %task.key, error = %e, "Failed to remove stale error file");
        }

        tracing::info!(
            task = %task.key,
            duration_ms = duration.as_millis() as u64,
            metrics = metrics.len(),
            "Task succeeded"
        );
        self.finish(task, TaskOutcome::Succeeded, metrics, None, duration)
    }

    async fn fail(&self, task: &TaskSpec, error: &StepError, duration: Duration) -> ExecutionResult {
        let detail = diagnostic(task, error);
        tracing::error!(task = %task.key, error = %error, "Task failed");
        self.persist_diagnostic(task, &detail).await;
        self.finish(task, TaskOutcome::Failed, BTreeMap::new(), Some(detail), duration)
    }

    fn defer(&self, task: &TaskSpec, missing: Vec<String>, duration: Duration) -> ExecutionResult {
        let reason = format!("dependency not ready: {}", missing.join(", "));
        tracing::warn!(task = %task.key, reason = %reason, "Task deferred");
        self.finish(task, TaskOutcome::Deferred, BTreeMap::new(), Some(reason), duration)
    }

    /// Records a task whose execution crashed outside the normal error path.
    pub async fn record_crash(&self, task: &TaskSpec, detail: String, duration: Duration) -> ExecutionResult {
        let detail = format!("{}\n{}", diagnostic_header(task), detail);
        self.persist_diagnostic(task, &detail).await;
        self.finish(task, TaskOutcome::Failed, BTreeMap::new(), Some(detail), duration)
    }

    async fn persist_diagnostic(&self, task: &TaskSpec, detail: &str) {
        if let Err(e) = artifacts::write_error(&task.artifact_dir, detail).await {
            tracing::error!(task = %task.key, error = %e, "Failed to write error file");
        }
    }

    fn finish(
        &self,
        task: &TaskSpec,
        outcome: TaskOutcome,
        metrics: BTreeMap<String, f64>,
        error_detail: Option<String>,
        duration: Duration,
    ) -> ExecutionResult {
        self.metrics.record_task(
            task.kind.as_str(),
            task.key.stage.as_str(),
            &outcome.to_string(),
            duration.as_secs_f64(),
        );
        ExecutionResult {
            key: task.key.clone(),
            kind: task.kind,
            outcome,
            metrics,
            artifact_dir: task.artifact_dir.clone(),
            error_detail,
            duration,
        }
    }
}

#[derive(Default)]
struct Upstream {
    trained_state_dir: Option<PathBuf>,
    models: Vec<UpstreamArtifact>,
}

enum Gathered {
    Ready(Upstream),
    Missing(Vec<String>),
}

fn diagnostic_header(task: &TaskSpec) -> String {
    format!(
        "task: {}\nkind: {}\nrevision: {}\nsource: {}\ntime: {}\n",
        task.key,
        task.kind,
        task.revision,
        task.source,
        Utc::now().to_rfc3339()
    )
}

/// Human-readable failure report: task identity plus the full error chain.
fn diagnostic(task: &TaskSpec, error: &(dyn StdError + 'static)) -> String {
    let mut out = diagnostic_header(task);
    out.push_str(&format!("error: {}\n", error));
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(&format!("caused by: {}\n", cause));
        source = cause.source();
    }
    out
}
