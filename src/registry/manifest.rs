//! The `pipeline.yaml` manifest a pipeline uses to export its components.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::locator::is_valid_name;
use super::{ComponentKind, ComponentRef};
use crate::error::ManifestError;

/// File name of the manifest at the root of every pipeline.
pub const MANIFEST_FILENAME: &str = "pipeline.yaml";

/// One exported component as written in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    /// Files or directories, relative to the pipeline root, that define it.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Program and arguments run for this component's stages.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Parsed manifest. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineManifest {
    #[serde(default)]
    pub interpreters: Vec<ComponentSpec>,
    #[serde(default)]
    pub models: Vec<ComponentSpec>,
    #[serde(default)]
    pub ensembles: Vec<ComponentSpec>,
    #[serde(default)]
    pub visualizers: Vec<ComponentSpec>,
}

impl PipelineManifest {
    /// Loads and validates the manifest found at `pipeline_root`.
    pub fn load(pipeline_root: &Path) -> Result<Self, ManifestError> {
        let path = pipeline_root.join(MANIFEST_FILENAME);
        if !path.is_file() {
            return Err(ManifestError::NotFound(path));
        }

        let contents = std::fs::read_to_string(&path)?;
        let manifest = Self::parse(&contents).map_err(|message| ManifestError::Parse {
            path: path.clone(),
            message,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn parse(contents: &str) -> Result<Self, String> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| e.to_string())
    }

    /// Names must be non-empty, unique per kind and made of the same
    /// characters as pipeline names. Every component must declare at least one
    /// source so it can be fingerprinted.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (kind, specs) in self.sections() {
            let mut seen = HashSet::new();
            for spec in specs {
                let name = spec.name.trim();
                if name.is_empty() {
                    return Err(ManifestError::EmptyName(kind.to_string()));
                }
                if !is_valid_name(name) {
                    return Err(ManifestError::InvalidName {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    });
                }
                if !seen.insert(name) {
                    return Err(ManifestError::DuplicateComponent {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    });
                }
                if spec.sources.is_empty() {
                    return Err(ManifestError::NoSources {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn sections(&self) -> [(ComponentKind, &[ComponentSpec]); 4] {
        [
            (ComponentKind::Interpreter, self.interpreters.as_slice()),
            (ComponentKind::Model, self.models.as_slice()),
            (ComponentKind::Ensemble, self.ensembles.as_slice()),
            (ComponentKind::Visualizer, self.visualizers.as_slice()),
        ]
    }

    /// Resolves the manifest into component references, preserving order.
    pub fn components(&self, pipeline: &str, kind: ComponentKind) -> Vec<ComponentRef> {
        let specs = match kind {
            ComponentKind::Interpreter => &self.interpreters,
            ComponentKind::Model => &self.models,
            ComponentKind::Ensemble => &self.ensembles,
            ComponentKind::Visualizer => &self.visualizers,
        };
        specs
            .iter()
            .map(|spec| ComponentRef {
                pipeline: pipeline.to_string(),
                kind,
                name: spec.name.trim().to_string(),
                sources: spec.sources.clone(),
                command: spec.command.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
interpreters:
  - name: voc
    sources: [interp/voc.py]
models:
  - name: yolo
    sources: [models/yolo.py]
    command: [python, -m, models.yolo]
  - name: ssd
    sources: [models/ssd]
ensembles:
  - name: vote
    sources: [ensembles/vote.py]
"#;

    fn write_manifest(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILENAME), contents).unwrap();
        dir
    }

    #[test]
    fn test_load_preserves_order() {
        let dir = write_manifest(MANIFEST);
        let manifest = PipelineManifest::load(dir.path()).unwrap();

        let models = manifest.components("obj_det", ComponentKind::Model);
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["yolo", "ssd"]);
        assert_eq!(models[0].command, vec!["python", "-m", "models.yolo"]);
        assert_eq!(models[0].pipeline, "obj_det");
        assert!(manifest.visualizers.is_empty());
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_empty_manifest_is_valid() {
        let dir = write_manifest("");
        let manifest = PipelineManifest::load(dir.path()).unwrap();
        assert_eq!(manifest, PipelineManifest::default());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = write_manifest(
            "models:\n  - name: yolo\n    sources: [a.py]\n  - name: yolo\n    sources: [b.py]\n",
        );
        let err = PipelineManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateComponent { .. }));
    }

    #[test]
    fn test_unsafe_component_names_rejected() {
        for name in ["\"a:b\"", "\"voc 2012\"", "\"../up\"", "\"a/b\""] {
            let dir = write_manifest(&format!(
                "interpreters:\n  - name: {}\n    sources: [i.py]\n",
                name
            ));
            let err = PipelineManifest::load(dir.path()).unwrap_err();
            assert!(
                matches!(err, ManifestError::InvalidName { .. }),
                "{name} accepted: {err:?}"
            );
        }

        let dir = write_manifest("models:\n  - name: yolo-v8.1_small\n    sources: [m.py]\n");
        assert!(PipelineManifest::load(dir.path()).is_ok());
    }

    #[test]
    fn test_component_without_sources_rejected() {
        let dir = write_manifest("ensembles:\n  - name: vote\n");
        let err = PipelineManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::NoSources { .. }));
    }

    #[test]
    fn test_malformed_manifest_reports_path() {
        let dir = write_manifest("models: {not: [a list}\n");
        let err = PipelineManifest::load(dir.path()).unwrap_err();
        match err {
            ManifestError::Parse { path, .. } => assert!(path.ends_with(MANIFEST_FILENAME)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_section_rejected() {
        let dir = write_manifest("trainers: []\n");
        assert!(PipelineManifest::load(dir.path()).is_err());
    }
}
