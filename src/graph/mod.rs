//! Task graph construction.
//!
//! Crosses every pipeline's interpreters, datasets and components into task
//! keys, fingerprints them and keeps the ones whose history is missing or
//! behind on any axis, or whose artifact directory lost its successful run. Tasks come out grouped by phase so that model stages
//! are fully resolved before the ensemble stages that consume them.

pub mod task;

pub use task::{Dependency, DependencyKind, Phase, Stage, TaskKey, TaskSpec};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::FingerprintError;
use crate::executor::artifacts::{self, ArtifactLayout};
use crate::fingerprint::{revision_fingerprint, source_fingerprint, upstream_fingerprint, Fingerprint};
use crate::history::{HistoryError, HistoryStore};
use crate::registry::{ComponentKind, ComponentRef, PipelineDescriptor};

/// A component left out of this cycle because it could not be fingerprinted.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedComponent {
    pub pipeline: String,
    pub kind: ComponentKind,
    pub component: String,
    pub reason: String,
}

/// Stale tasks of one cycle, in phase order.
#[derive(Debug, Default)]
pub struct TaskGraph {
    pub tasks: Vec<TaskSpec>,
    pub skipped: Vec<SkippedComponent>,
    /// Number of task keys examined, stale or not.
    pub considered: usize,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Splits the graph into its phases, in execution order. Empty phases
    /// are kept so callers see every phase.
    pub fn into_phases(self) -> Vec<(Phase, Vec<TaskSpec>)> {
        let mut phases: Vec<(Phase, Vec<TaskSpec>)> =
            Phase::ORDER.iter().map(|p| (*p, Vec::new())).collect();
        for task in self.tasks {
            if let Some(idx) = task.phase().index() {
                phases[idx].1.push(task);
            }
        }
        phases
    }
}

/// A component together with its source fingerprint.
struct Resolved {
    component: ComponentRef,
    source: Fingerprint,
}

/// Builds the stale task graph from a discovery snapshot.
pub struct TaskGraphBuilder {
    history: HistoryStore,
    layout: ArtifactLayout,
    datasets_dir: PathBuf,
    stages: Vec<Stage>,
}

impl TaskGraphBuilder {
    pub fn new(
        history: HistoryStore,
        layout: ArtifactLayout,
        datasets_dir: impl Into<PathBuf>,
        stages: Vec<Stage>,
    ) -> Self {
        Self {
            history,
            layout,
            datasets_dir: datasets_dir.into(),
            stages,
        }
    }

    /// Dataset locations of one interpreter, sorted by name.
    ///
    /// Datasets live under `{datasets_dir}/{pipeline}/{interpreter}/`; each
    /// entry (file or directory) not starting with a dot is one dataset.
    pub async fn datasets_for(&self, pipeline: &str, interpreter: &str) -> Vec<(String, PathBuf)> {
        let dir = self.datasets_dir.join(pipeline).join(interpreter);
        match tokio::task::spawn_blocking(move || list_datasets(&dir)).await {
            Ok(datasets) => datasets,
            Err(e) => {
                tracing::warn!(pipeline, interpreter, error = %e, "Dataset listing aborted");
                Vec::new()
            }
        }
    }

    /// Returns every task with at least one stale axis.
    ///
    /// # Errors
    ///
    /// Only history store failures abort the build; unresolvable components
    /// are reported in `TaskGraph::skipped`.
    pub async fn build_stale_tasks(
        &self,
        pipelines: &[Arc<PipelineDescriptor>],
    ) -> Result<TaskGraph, HistoryError> {
        let mut graph = TaskGraph::default();
        let mut phases: Vec<Vec<TaskSpec>> = vec![Vec::new(); Phase::ORDER.len()];

        for pipeline in pipelines {
            let revision = revision_fingerprint(pipeline);
            let models = resolve_all(pipeline, &pipeline.models, &mut graph.skipped).await;

            // Ensembles consume every model, so one unresolvable model blocks them.
            let all_models_resolved = models.len() == pipeline.models.len();
            let upstream = upstream_fingerprint(
                models
                    .iter()
                    .map(|m| (m.component.name.as_str(), &m.source)),
            );
            let ensembles = if all_models_resolved {
                resolve_all(pipeline, &pipeline.ensembles, &mut graph.skipped).await
            } else {
                for ensemble in &pipeline.ensembles {
                    graph.skipped.push(SkippedComponent {
                        pipeline: pipeline.name.clone(),
                        kind: ComponentKind::Ensemble,
                        component: ensemble.name.clone(),
                        reason: "an upstream model is unresolvable".to_string(),
                    });
                }
                Vec::new()
            };

            for interpreter in &pipeline.interpreters {
                let datasets = self.datasets_for(&pipeline.name, &interpreter.name).await;
                if datasets.is_empty() {
                    tracing::debug!(
                        pipeline = %pipeline.name,
                        interpreter = %interpreter.name,
                        "No datasets found for interpreter"
                    );
                }

                for (dataset, dataset_dir) in &datasets {
                    let ctx = TaskContext {
                        pipeline,
                        interpreter,
                        dataset,
                        dataset_dir,
                        revision: &revision,
                    };

                    for model in &models {
                        for &stage in &self.stages {
                            let spec = self.task_spec(&ctx, model, None, stage, &models);
                            graph.considered += 1;
                            if let Some(spec) = self.keep_if_stale(spec).await? {
                                phases[phase_index(ComponentKind::Model, stage)].push(spec);
                            }
                        }
                    }

                    for ensemble in &ensembles {
                        for &stage in &self.stages {
                            let spec =
                                self.task_spec(&ctx, ensemble, Some(&upstream), stage, &models);
                            graph.considered += 1;
                            if let Some(spec) = self.keep_if_stale(spec).await? {
                                phases[phase_index(ComponentKind::Ensemble, stage)].push(spec);
                            }
                        }
                    }
                }
            }
        }

        graph.tasks = phases.into_iter().flatten().collect();
        tracing::info!(
            considered = graph.considered,
            stale = graph.tasks.len(),
            skipped = graph.skipped.len(),
            "Task graph built"
        );
        Ok(graph)
    }

    fn task_spec(
        &self,
        ctx: &TaskContext<'_>,
        component: &Resolved,
        upstream: Option<&Fingerprint>,
        stage: Stage,
        models: &[Resolved],
    ) -> TaskSpec {
        let kind = component.component.kind;
        let key = TaskKey::new(
            &ctx.pipeline.name,
            &ctx.interpreter.name,
            ctx.dataset,
            &component.component.name,
            stage,
        );
        let segment = ArtifactLayout::fingerprint_segment(ctx.revision, &component.source, upstream);
        let artifact_dir = self.layout.task_dir(kind, &key, &segment);

        let mut dependencies = Vec::new();
        if stage == Stage::Test && self.stages.contains(&Stage::Train) {
            let train_key = TaskKey {
                stage: Stage::Train,
                ..key.clone()
            };
            dependencies.push(Dependency {
                component: component.component.name.clone(),
                kind: DependencyKind::TrainedState,
                artifact_dir: self.layout.task_dir(kind, &train_key, &segment),
            });
        }
        if kind == ComponentKind::Ensemble {
            for model in models {
                let model_key = TaskKey::new(
                    &ctx.pipeline.name,
                    &ctx.interpreter.name,
                    ctx.dataset,
                    &model.component.name,
                    stage,
                );
                let model_segment =
                    ArtifactLayout::fingerprint_segment(ctx.revision, &model.source, None);
                dependencies.push(Dependency {
                    component: model.component.name.clone(),
                    kind: DependencyKind::ModelOutput,
                    artifact_dir: self.layout.task_dir(
                        ComponentKind::Model,
                        &model_key,
                        &model_segment,
                    ),
                });
            }
        }

        TaskSpec {
            key,
            kind,
            pipeline: Arc::clone(ctx.pipeline),
            component: component.component.clone(),
            interpreter: ctx.interpreter.clone(),
            dataset_dir: ctx.dataset_dir.to_path_buf(),
            revision: ctx.revision.clone(),
            source: component.source.clone(),
            upstream: upstream.cloned(),
            artifact_dir,
            dependencies,
            stale_axes: Vec::new(),
            outputs_missing: false,
        }
    }

    /// A task is stale when any axis differs from history (logical OR).
    ///
    /// A task whose history is current is still stale when its artifact
    /// directory no longer holds a successful run, since its dependents could
    /// otherwise never become ready.
    async fn keep_if_stale(&self, mut spec: TaskSpec) -> Result<Option<TaskSpec>, HistoryError> {
        for (axis, current) in spec.fingerprints() {
            let recorded = self.history.get(&spec.key, axis).await?;
            if recorded.as_ref() != Some(&current) {
                spec.stale_axes.push(axis);
            }
        }

        if spec.stale_axes.is_empty() {
            if artifacts::is_complete(&spec.artifact_dir).await {
                tracing::trace!(task = %spec.key, "Task up to date");
                return Ok(None);
            }
            spec.outputs_missing = true;
        }

        tracing::debug!(
            task = %spec.key,
            axes = ?spec.stale_axes,
            outputs_missing = spec.outputs_missing,
            "Task stale"
        );
        Ok(Some(spec))
    }
}

struct TaskContext<'a> {
    pipeline: &'a Arc<PipelineDescriptor>,
    interpreter: &'a ComponentRef,
    dataset: &'a str,
    dataset_dir: &'a Path,
    revision: &'a Fingerprint,
}

/// Fingerprints the sources of `components` off the async runtime.
///
/// Components that cannot be fingerprinted are reported in `skipped` and left
/// out of the result.
async fn resolve_all(
    pipeline: &PipelineDescriptor,
    components: &[ComponentRef],
    skipped: &mut Vec<SkippedComponent>,
) -> Vec<Resolved> {
    let root = pipeline.local_path.clone();
    let owned = components.to_vec();
    let fingerprints: Vec<(ComponentRef, Result<Fingerprint, FingerprintError>)> =
        match tokio::task::spawn_blocking(move || {
            owned
                .into_iter()
                .map(|component| {
                    let source = source_fingerprint(&root, &component);
                    (component, source)
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(fingerprints) => fingerprints,
            Err(e) => {
                tracing::warn!(pipeline = %pipeline.name, error = %e, "Fingerprinting aborted");
                for component in components {
                    skipped.push(SkippedComponent {
                        pipeline: pipeline.name.clone(),
                        kind: component.kind,
                        component: component.name.clone(),
                        reason: format!("fingerprinting aborted: {}", e),
                    });
                }
                return Vec::new();
            }
        };

    let mut resolved = Vec::with_capacity(fingerprints.len());
    for (component, source) in fingerprints {
        match source {
            Ok(source) => resolved.push(Resolved { component, source }),
            Err(e) => {
                tracing::warn!(
                    pipeline = %pipeline.name,
                    component = %component.name,
                    error = %e,
                    "Component unresolvable, skipping this cycle"
                );
                skipped.push(SkippedComponent {
                    pipeline: pipeline.name.clone(),
                    kind: component.kind,
                    component: component.name,
                    reason: e.to_string(),
                });
            }
        }
    }
    resolved
}

fn phase_index(kind: ComponentKind, stage: Stage) -> usize {
    match (kind, stage) {
        (ComponentKind::Ensemble, Stage::Train) => 2,
        (ComponentKind::Ensemble, Stage::Test) => 3,
        (_, Stage::Train) => 0,
        (_, Stage::Test) => 1,
    }
}

fn list_datasets(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to list datasets");
            return Vec::new();
        }
    };

    let mut datasets: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.starts_with('.') {
                return None;
            }
            Some((name, entry.path()))
        })
        .collect();
    datasets.sort_by(|a, b| a.0.cmp(&b.0));
    datasets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Axis;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        pipeline: Arc<PipelineDescriptor>,
        builder: TaskGraphBuilder,
        history: HistoryStore,
    }

    fn component(kind: ComponentKind, name: &str) -> ComponentRef {
        ComponentRef {
            pipeline: "P".to_string(),
            kind,
            name: name.to_string(),
            sources: vec![PathBuf::from(format!("{}.py", name))],
            command: Vec::new(),
        }
    }

    async fn fixture(stages: Vec<Stage>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let src = root.join("src");
        fs::create_dir_all(&src).unwrap();
        for name in ["I", "M", "N", "E"] {
            fs::write(src.join(format!("{}.py", name)), format!("# {}\n", name)).unwrap();
        }
        fs::create_dir_all(root.join("datasets/P/I/D")).unwrap();

        let pipeline = Arc::new(PipelineDescriptor {
            name: "P".to_string(),
            locator: src.display().to_string(),
            local_path: src,
            revision: "r1".to_string(),
            interpreters: vec![component(ComponentKind::Interpreter, "I")],
            models: vec![component(ComponentKind::Model, "M")],
            ensembles: vec![component(ComponentKind::Ensemble, "E")],
            visualizers: Vec::new(),
        });

        let history = HistoryStore::open_in_memory("test").await.unwrap();
        let builder = TaskGraphBuilder::new(
            history.clone(),
            ArtifactLayout::new(root.join("artifacts")),
            root.join("datasets"),
            stages,
        );

        Fixture {
            _temp: temp,
            root,
            pipeline,
            builder,
            history,
        }
    }

    async fn mark_done(history: &HistoryStore, graph: &TaskGraph) {
        for task in &graph.tasks {
            history.set_all(&task.key, &task.fingerprints()).await.unwrap();
            let dir = &task.artifact_dir;
            artifacts::ensure_dir(dir).await.unwrap();
            artifacts::write_json(&dir.join(artifacts::RESULTS_FILE), &serde_json::json!({}))
                .await
                .unwrap();
            artifacts::write_json(&dir.join(artifacts::PREDICTIONS_FILE), &serde_json::json!([]))
                .await
                .unwrap();
            artifacts::mark_success(dir).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_history_makes_everything_stale() {
        let fx = fixture(vec![Stage::Train]).await;
        let graph = fx
            .builder
            .build_stale_tasks(&[Arc::clone(&fx.pipeline)])
            .await
            .unwrap();

        let keys: Vec<String> = graph.tasks.iter().map(|t| t.key.to_string()).collect();
        assert_eq!(keys, vec!["P:I:D:M:train", "P:I:D:E:train"]);
        assert_eq!(graph.considered, 2);
        assert!(graph.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_recorded_history_makes_nothing_stale() {
        let fx = fixture(vec![Stage::Train, Stage::Test]).await;
        let pipelines = [Arc::clone(&fx.pipeline)];
        let first = fx.builder.build_stale_tasks(&pipelines).await.unwrap();
        assert_eq!(first.len(), 4);
        mark_done(&fx.history, &first).await;

        let second = fx.builder.build_stale_tasks(&pipelines).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(second.considered, 4);
    }

    #[tokio::test]
    async fn test_revision_change_alone_is_stale() {
        let fx = fixture(vec![Stage::Train]).await;
        let first = fx
            .builder
            .build_stale_tasks(&[Arc::clone(&fx.pipeline)])
            .await
            .unwrap();
        mark_done(&fx.history, &first).await;

        let mut bumped = (*fx.pipeline).clone();
        bumped.revision = "r2".to_string();
        let graph = fx.builder.build_stale_tasks(&[Arc::new(bumped)]).await.unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.tasks.iter().all(|t| t.stale_axes == vec![Axis::Revision]));
    }

    #[tokio::test]
    async fn test_model_source_change_reschedules_model_and_dependent_ensemble() {
        let fx = fixture(vec![Stage::Train]).await;
        let pipelines = [Arc::clone(&fx.pipeline)];
        let first = fx.builder.build_stale_tasks(&pipelines).await.unwrap();
        mark_done(&fx.history, &first).await;

        fs::write(fx.root.join("src/M.py"), "# M v2\n").unwrap();
        let graph = fx.builder.build_stale_tasks(&pipelines).await.unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.tasks[0].key.component, "M");
        assert_eq!(graph.tasks[0].stale_axes, vec![Axis::Source]);
        assert_eq!(graph.tasks[1].key.component, "E");
        assert_eq!(graph.tasks[1].stale_axes, vec![Axis::Upstream]);
    }

    #[tokio::test]
    async fn test_lost_outputs_reschedule_up_to_date_task() {
        let fx = fixture(vec![Stage::Train]).await;
        let pipelines = [Arc::clone(&fx.pipeline)];
        let first = fx.builder.build_stale_tasks(&pipelines).await.unwrap();
        mark_done(&fx.history, &first).await;

        let model_dir = first.tasks[0].artifact_dir.clone();
        fs::remove_file(model_dir.join(artifacts::SUCCESS_FILE)).unwrap();
        let graph = fx.builder.build_stale_tasks(&pipelines).await.unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.tasks[0].key.component, "M");
        assert!(graph.tasks[0].stale_axes.is_empty());
        assert!(graph.tasks[0].outputs_missing);
    }

    #[tokio::test]
    async fn test_unresolvable_model_skips_it_and_ensembles() {
        let fx = fixture(vec![Stage::Train]).await;
        let mut broken = (*fx.pipeline).clone();
        broken.models.push(component(ComponentKind::Model, "missing"));

        let graph = fx.builder.build_stale_tasks(&[Arc::new(broken)]).await.unwrap();

        let keys: Vec<String> = graph.tasks.iter().map(|t| t.key.to_string()).collect();
        assert_eq!(keys, vec!["P:I:D:M:train"]);
        let skipped: Vec<&str> = graph.skipped.iter().map(|s| s.component.as_str()).collect();
        assert_eq!(skipped, vec!["missing", "E"]);
    }

    #[tokio::test]
    async fn test_dependencies_and_phase_order() {
        let fx = fixture(vec![Stage::Train, Stage::Test]).await;
        let graph = fx
            .builder
            .build_stale_tasks(&[Arc::clone(&fx.pipeline)])
            .await
            .unwrap();

        let phases = graph.into_phases();
        assert_eq!(phases.len(), 4);
        for (phase, tasks) in &phases {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].phase(), *phase);
        }

        let model_train = &phases[0].1[0];
        assert!(model_train.dependencies.is_empty());

        let model_test = &phases[1].1[0];
        assert_eq!(model_test.dependencies.len(), 1);
        assert_eq!(model_test.dependencies[0].kind, DependencyKind::TrainedState);
        assert_eq!(model_test.dependencies[0].artifact_dir, model_train.artifact_dir);

        let ensemble_test = &phases[3].1[0];
        let kinds: Vec<DependencyKind> =
            ensemble_test.dependencies.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DependencyKind::TrainedState, DependencyKind::ModelOutput]);
        assert_eq!(ensemble_test.dependencies[1].artifact_dir, model_test.artifact_dir);
        assert!(ensemble_test.upstream.is_some());
    }

    #[tokio::test]
    async fn test_similar_dataset_names_get_distinct_dirs() {
        let fx = fixture(vec![Stage::Train]).await;
        for name in ["voc 2012", "voc_2012"] {
            fs::create_dir_all(fx.root.join("datasets/P/I").join(name)).unwrap();
        }
        let graph = fx
            .builder
            .build_stale_tasks(&[Arc::clone(&fx.pipeline)])
            .await
            .unwrap();

        let dirs: std::collections::HashSet<&PathBuf> =
            graph.tasks.iter().map(|t| &t.artifact_dir).collect();
        assert_eq!(graph.len(), 6);
        assert_eq!(dirs.len(), 6);
    }

    #[test]
    fn test_list_datasets_sorted_and_hidden_skipped() {
        let temp = TempDir::new().unwrap();
        for name in ["b", "a", ".cache"] {
            fs::create_dir_all(temp.path().join(name)).unwrap();
        }
        fs::write(temp.path().join("c.csv"), "x\n").unwrap();

        let names: Vec<String> = list_datasets(temp.path()).into_iter().map(|d| d.0).collect();
        assert_eq!(names, vec!["a", "b", "c.csv"]);
        assert!(list_datasets(&temp.path().join("missing")).is_empty());
    }
}
