//! Content fingerprints for components and pipeline revisions.
//!
//! A component's fingerprint is a SHA-256 digest over the files it declares in
//! its pipeline manifest: each file contributes its path relative to the
//! pipeline root and its bytes. Nothing else in the pipeline tree affects it,
//! so editing one model never invalidates another.
//!
//! Revision fingerprints are not computed here. They are the opaque revision
//! identifiers reported by the source synchronizer.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::FingerprintError;
use crate::registry::{ComponentRef, PipelineDescriptor};

/// Directory names never included in a tree fingerprint.
const IGNORED_DIRS: &[&str] = &[".git", "__pycache__"];

/// An opaque, comparable identity token for code or a revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns at most the first `len` characters.
    pub fn short(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Computes the source fingerprint of a component.
///
/// # Errors
///
/// Returns `FingerprintError` when a declared source is missing, unreadable,
/// or points outside the pipeline root. The caller treats this as
/// `ComponentUnresolvable`.
pub fn source_fingerprint(
    pipeline_root: &Path,
    component: &ComponentRef,
) -> Result<Fingerprint, FingerprintError> {
    let mut hasher = Sha256::new();

    for declared in &component.sources {
        if declared.is_absolute()
            || declared
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FingerprintError::OutsideRoot {
                component: component.name.clone(),
                path: declared.clone(),
            });
        }

        let path = pipeline_root.join(declared);
        if !path.exists() {
            return Err(FingerprintError::SourceNotFound {
                component: component.name.clone(),
                path: declared.clone(),
            });
        }

        for file in collect_files(&path)? {
            let relative = file.strip_prefix(pipeline_root).unwrap_or(&file);
            hash_file(&mut hasher, relative, &file)?;
        }
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Returns the pipeline's revision fingerprint as reported by the synchronizer.
pub fn revision_fingerprint(pipeline: &PipelineDescriptor) -> Fingerprint {
    Fingerprint::new(pipeline.revision.clone())
}

/// Digest over an ensemble's upstream models, in registry order.
pub fn upstream_fingerprint<'a, I>(models: I) -> Fingerprint
where
    I: IntoIterator<Item = (&'a str, &'a Fingerprint)>,
{
    let mut hasher = Sha256::new();
    for (name, fingerprint) in models {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_str().as_bytes());
        hasher.update([b'\n']);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Digest over every file below `root`, used as the revision of pipelines
/// that are not under version control.
pub fn tree_fingerprint(root: &Path) -> Result<Fingerprint, FingerprintError> {
    let mut hasher = Sha256::new();
    for file in collect_files(root)? {
        let relative = file.strip_prefix(root).unwrap_or(&file);
        hash_file(&mut hasher, relative, &file)?;
    }
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>, FingerprintError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name)))
        });

    for entry in walker {
        let entry = entry.map_err(|e| FingerprintError::Walk {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

fn hash_file(hasher: &mut Sha256, relative: &Path, file: &Path) -> Result<(), FingerprintError> {
    let bytes = fs::read(file).map_err(|source| FingerprintError::Read {
        path: file.to_path_buf(),
        source,
    })?;

    // Normalise separators so the digest is identical across platforms.
    let name = relative.to_string_lossy().replace('\\', "/");
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentKind;
    use tempfile::TempDir;

    fn model(sources: &[&str]) -> ComponentRef {
        ComponentRef {
            pipeline: "obj_det".to_string(),
            kind: ComponentKind::Model,
            name: "yolo".to_string(),
            sources: sources.iter().map(PathBuf::from).collect(),
            command: Vec::new(),
        }
    }

    #[test]
    fn test_source_fingerprint_is_deterministic() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("yolo.py"), "class Yolo: pass\n").unwrap();

        let a = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();
        let b = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_source_fingerprint_tracks_content() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("yolo.py");
        fs::write(&file, "class Yolo: pass\n").unwrap();
        let before = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();

        fs::write(&file, "class Yolo:\n    layers = 3\n").unwrap();
        let after = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_source_fingerprint_ignores_unrelated_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("yolo.py"), "class Yolo: pass\n").unwrap();
        let before = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();

        fs::write(temp.path().join("resnet.py"), "class ResNet: pass\n").unwrap();
        let after = source_fingerprint(temp.path(), &model(&["yolo.py"])).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_source_fingerprint_walks_directories() {
        let temp = TempDir::new().unwrap();
        let pkg = temp.path().join("yolo");
        fs::create_dir_all(pkg.join("__pycache__")).unwrap();
        fs::write(pkg.join("a.py"), "A = 1\n").unwrap();
        fs::write(pkg.join("b.py"), "B = 2\n").unwrap();
        let before = source_fingerprint(temp.path(), &model(&["yolo"])).unwrap();

        fs::write(pkg.join("__pycache__").join("a.pyc"), [0u8, 1, 2]).unwrap();
        let with_cache = source_fingerprint(temp.path(), &model(&["yolo"])).unwrap();
        assert_eq!(before, with_cache);

        fs::write(pkg.join("b.py"), "B = 3\n").unwrap();
        let after = source_fingerprint(temp.path(), &model(&["yolo"])).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_source_fingerprint_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = source_fingerprint(temp.path(), &model(&["missing.py"])).unwrap_err();
        assert!(matches!(err, FingerprintError::SourceNotFound { .. }));
    }

    #[test]
    fn test_source_fingerprint_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let err = source_fingerprint(temp.path(), &model(&["../etc/passwd"])).unwrap_err();
        assert!(matches!(err, FingerprintError::OutsideRoot { .. }));
    }

    #[test]
    fn test_upstream_fingerprint_depends_on_every_model() {
        let h1 = Fingerprint::from("h1");
        let h2 = Fingerprint::from("h2");
        let h3 = Fingerprint::from("h3");

        let base = upstream_fingerprint([("yolo", &h1), ("ssd", &h2)]);
        let same = upstream_fingerprint([("yolo", &h1), ("ssd", &h2)]);
        let changed = upstream_fingerprint([("yolo", &h1), ("ssd", &h3)]);
        assert_eq!(base, same);
        assert_ne!(base, changed);
    }

    #[test]
    fn test_tree_fingerprint_skips_git_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("pipeline.yaml"), "models: []\n").unwrap();
        let before = tree_fingerprint(temp.path()).unwrap();

        fs::create_dir_all(temp.path().join(".git")).unwrap();
        fs::write(temp.path().join(".git").join("HEAD"), "ref: main\n").unwrap();
        assert_eq!(before, tree_fingerprint(temp.path()).unwrap());
    }

    #[test]
    fn test_fingerprint_short() {
        let fp = Fingerprint::from("abcdef0123456789");
        assert_eq!(fp.short(6), "abcdef");
        assert_eq!(fp.short(100), "abcdef0123456789");
    }
}
