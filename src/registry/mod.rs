//! Pipeline registry: discovers pipelines and the components they export.
//!
//! Discovery runs once per scheduling cycle and produces an immutable
//! snapshot. Each pipeline is synchronized and resolved independently; a
//! pipeline that fails either step is reported and left out of the snapshot
//! without affecting the others.

pub mod locator;
pub mod manifest;
pub mod sync;

pub use locator::{read_source_list, PipelineLocator};
pub use manifest::{ComponentSpec, PipelineManifest, MANIFEST_FILENAME};
pub use sync::{DefaultSync, GitSync, LocalSync, SourceSync, SyncedSource};

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ManifestError, SyncError};
use crate::scheduler::CancelSignal;

/// Capability a pipeline component provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Interpreter,
    Model,
    Ensemble,
    Visualizer,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Interpreter => "interpreter",
            ComponentKind::Model => "model",
            ComponentKind::Ensemble => "ensemble",
            ComponentKind::Visualizer => "visualizer",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named component exported by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub pipeline: String,
    pub kind: ComponentKind,
    pub name: String,
    /// Defining sources, relative to the pipeline root.
    pub sources: Vec<PathBuf>,
    /// Program and arguments for running this component; may be empty.
    pub command: Vec<String>,
}

/// One synchronized pipeline and its resolved components.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub name: String,
    pub locator: String,
    pub local_path: PathBuf,
    pub revision: String,
    pub interpreters: Vec<ComponentRef>,
    pub models: Vec<ComponentRef>,
    pub ensembles: Vec<ComponentRef>,
    pub visualizers: Vec<ComponentRef>,
}

impl PipelineDescriptor {
    /// Builds a descriptor from a synced source tree and its manifest.
    pub fn resolve(
        locator: &PipelineLocator,
        synced: SyncedSource,
    ) -> Result<Self, ManifestError> {
        let manifest = PipelineManifest::load(&synced.local_path)?;
        let name = locator.name.as_str();

        Ok(Self {
            name: name.to_string(),
            locator: locator.raw.clone(),
            local_path: synced.local_path,
            revision: synced.revision,
            interpreters: manifest.components(name, ComponentKind::Interpreter),
            models: manifest.components(name, ComponentKind::Model),
            ensembles: manifest.components(name, ComponentKind::Ensemble),
            visualizers: manifest.components(name, ComponentKind::Visualizer),
        })
    }
}

/// Why a pipeline was left out of a cycle.
#[derive(Debug, Error)]
pub enum DiscoveryFailureKind {
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("resolution failed: {0}")]
    Manifest(#[from] ManifestError),
}

/// A pipeline excluded from this cycle, with the reason.
#[derive(Debug)]
pub struct DiscoveryFailure {
    pub locator: String,
    pub error: DiscoveryFailureKind,
}

/// Output of one discovery pass.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Successfully resolved pipelines, in source list order.
    pub pipelines: Vec<Arc<PipelineDescriptor>>,
    pub failures: Vec<DiscoveryFailure>,
}

/// Errors that stop discovery as a whole.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to read pipeline source list '{path}': {source}")]
    SourceList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery cancelled")]
    Cancelled,
}

/// Discovers pipelines listed in a source list file.
pub struct PipelineRegistry {
    sources_file: PathBuf,
    sync: Arc<dyn SourceSync>,
}

impl PipelineRegistry {
    pub fn new(sources_file: impl Into<PathBuf>, sync: Arc<dyn SourceSync>) -> Self {
        Self {
            sources_file: sources_file.into(),
            sync,
        }
    }

    /// Synchronizes and resolves every configured pipeline.
    pub async fn discover(&self, cancel: &CancelSignal) -> Result<Discovery, DiscoveryError> {
        let lines = read_source_list(&self.sources_file).map_err(|source| {
            DiscoveryError::SourceList {
                path: self.sources_file.clone(),
                source,
            }
        })?;

        let mut discovery = Discovery::default();
        let mut names = HashSet::new();

        for raw in lines {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            match self.discover_one(&raw, &names).await {
                Ok(descriptor) => {
                    tracing::info!(
                        pipeline = %descriptor.name,
                        revision = %descriptor.revision,
                        interpreters = descriptor.interpreters.len(),
                        models = descriptor.models.len(),
                        ensembles = descriptor.ensembles.len(),
                        visualizers = descriptor.visualizers.len(),
                        "Pipeline discovered"
                    );
                    names.insert(descriptor.name.clone());
                    discovery.pipelines.push(Arc::new(descriptor));
                }
                Err(error) => {
                    tracing::error!(locator = %raw, error = %error, "Pipeline excluded from cycle");
                    discovery.failures.push(DiscoveryFailure { locator: raw, error });
                }
            }
        }

        Ok(discovery)
    }

    async fn discover_one(
        &self,
        raw: &str,
        seen: &HashSet<String>,
    ) -> Result<PipelineDescriptor, DiscoveryFailureKind> {
        let locator = PipelineLocator::parse(raw)?;
        if seen.contains(&locator.name) {
            return Err(ManifestError::DuplicatePipeline(locator.name).into());
        }

        let synced = self.sync.sync(&locator).await?;
        Ok(PipelineDescriptor::resolve(&locator, synced)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_pipeline(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_discover_isolates_failures() {
        let temp = tempfile::tempdir().unwrap();
        let good = write_pipeline(
            temp.path(),
            "good",
            "models:\n  - name: yolo\n    sources: [yolo.py]\n",
        );
        let broken = write_pipeline(temp.path(), "broken", "models: [[[\n");
        let missing = temp.path().join("missing");

        let list = temp.path().join("pipelines.txt");
        std::fs::write(
            &list,
            format!(
                "{}\n{}\n{}\n",
                broken.display(),
                missing.display(),
                good.display()
            ),
        )
        .unwrap();

        let registry = PipelineRegistry::new(&list, Arc::new(LocalSync));
        let discovery = registry.discover(&CancelSignal::new()).await.unwrap();

        assert_eq!(discovery.pipelines.len(), 1);
        assert_eq!(discovery.pipelines[0].name, "good");
        assert_eq!(discovery.pipelines[0].models[0].name, "yolo");
        assert_eq!(discovery.failures.len(), 2);
        assert!(matches!(
            discovery.failures[0].error,
            DiscoveryFailureKind::Manifest(ManifestError::Parse { .. })
        ));
        assert!(matches!(
            discovery.failures[1].error,
            DiscoveryFailureKind::Sync(SyncError::MissingSource(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_rejects_duplicate_names() {
        let temp = tempfile::tempdir().unwrap();
        let a = write_pipeline(&temp.path().join("a"), "obj_det", "");
        let b = write_pipeline(&temp.path().join("b"), "obj_det", "");

        let list = temp.path().join("pipelines.txt");
        std::fs::write(&list, format!("{}\n{}\n", a.display(), b.display())).unwrap();

        let registry = PipelineRegistry::new(&list, Arc::new(LocalSync));
        let discovery = registry.discover(&CancelSignal::new()).await.unwrap();
        assert_eq!(discovery.pipelines.len(), 1);
        assert_eq!(discovery.pipelines[0].local_path, a);
        assert!(matches!(
            discovery.failures[0].error,
            DiscoveryFailureKind::Manifest(ManifestError::DuplicatePipeline(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_source_list_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let registry = PipelineRegistry::new(temp.path().join("nope.txt"), Arc::new(LocalSync));
        let err = registry.discover(&CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::SourceList { .. }));
    }

    #[tokio::test]
    async fn test_discover_stops_when_cancelled() {
        let temp = tempfile::tempdir().unwrap();
        let a = write_pipeline(temp.path(), "a", "");
        let list = temp.path().join("pipelines.txt");
        std::fs::write(&list, format!("{}\n", a.display())).unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        let registry = PipelineRegistry::new(&list, Arc::new(LocalSync));
        let err = registry.discover(&cancel).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Cancelled));
    }
}
