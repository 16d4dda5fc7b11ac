//! Task identities and descriptors.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::history::Axis;
use crate::registry::{ComponentKind, ComponentRef, PipelineDescriptor};

/// Stage of a component's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Train,
    Test,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Train => "train",
            Stage::Test => "test",
        }
    }

    /// Suffix of the artifact base directory (`model_training`, ...).
    pub fn artifact_suffix(&self) -> &'static str {
        match self {
            Stage::Train => "training",
            Stage::Test => "testing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" | "training" => Ok(Stage::Train),
            "test" | "testing" | "evaluate" => Ok(Stage::Test),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Unique identity of one schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub pipeline: String,
    pub interpreter: String,
    pub dataset: String,
    pub component: String,
    pub stage: Stage,
}

impl TaskKey {
    pub fn new(
        pipeline: impl Into<String>,
        interpreter: impl Into<String>,
        dataset: impl Into<String>,
        component: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            interpreter: interpreter.into(),
            dataset: dataset.into(),
            component: component.into(),
            stage,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.pipeline, self.interpreter, self.dataset, self.component, self.stage
        )
    }
}

/// A (component kind, stage) group of tasks. Phases run in `Phase::ORDER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Phase {
    pub kind: ComponentKind,
    pub stage: Stage,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [
        Phase {
            kind: ComponentKind::Model,
            stage: Stage::Train,
        },
        Phase {
            kind: ComponentKind::Model,
            stage: Stage::Test,
        },
        Phase {
            kind: ComponentKind::Ensemble,
            stage: Stage::Train,
        },
        Phase {
            kind: ComponentKind::Ensemble,
            stage: Stage::Test,
        },
    ];

    pub fn new(kind: ComponentKind, stage: Stage) -> Self {
        Self { kind, stage }
    }

    /// Position in `ORDER`, or `None` for kinds that never run stages.
    pub fn index(&self) -> Option<usize> {
        Self::ORDER.iter().position(|p| p == self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.stage)
    }
}

/// What a dependency supplies to the dependent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The same component's trained state, consumed by its test stage.
    TrainedState,
    /// A model's outputs, consumed by an ensemble.
    ModelOutput,
}

/// An upstream artifact directory a task needs before it can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub component: String,
    pub kind: DependencyKind,
    pub artifact_dir: PathBuf,
}

/// Everything needed to execute one stale task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub key: TaskKey,
    pub kind: ComponentKind,
    pub pipeline: Arc<PipelineDescriptor>,
    pub component: ComponentRef,
    pub interpreter: ComponentRef,
    pub dataset_dir: PathBuf,
    pub revision: Fingerprint,
    pub source: Fingerprint,
    /// Digest of upstream model sources; ensembles only.
    pub upstream: Option<Fingerprint>,
    pub artifact_dir: PathBuf,
    pub dependencies: Vec<Dependency>,
    /// Axes whose recorded fingerprint is missing or behind.
    pub stale_axes: Vec<Axis>,
    /// History is current but the directory no longer holds a successful run.
    pub outputs_missing: bool,
}

impl TaskSpec {
    pub fn phase(&self) -> Phase {
        Phase::new(self.kind, self.key.stage)
    }

    /// Current fingerprint on every axis that applies to this task.
    pub fn fingerprints(&self) -> Vec<(Axis, Fingerprint)> {
        let mut fps = vec![
            (Axis::Revision, self.revision.clone()),
            (Axis::Source, self.source.clone()),
        ];
        if let Some(upstream) = &self.upstream {
            fps.push((Axis::Upstream, upstream.clone()));
        }
        fps
    }
}
