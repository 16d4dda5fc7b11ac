//! Fingerprint-namespaced artifact storage.
//!
//! Every task owns exactly one directory:
//!
//! ```text
//! {root}/{kind}_{training|testing}/{pipeline}/{interpreter}/{dataset}/{component}/{fingerprint}/
//!     results.json      metric name -> value
//!     predictions.json  stage predictions
//!     state/            trained component state
//!     error.txt         diagnostic of the last failed attempt
//!     _SUCCESS          present only once history recorded the task
//! ```
//!
//! Directories for different fingerprints never collide, so older artifacts
//! stay inspectable. Files are written to a temporary name and renamed into
//! place, so readers never see a partial write.
//!
//! A directory is ready for downstream stages only while `_SUCCESS` exists.
//! Outputs alone are not enough: a task can write them and still fail in a
//! later step.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::fingerprint::Fingerprint;
use crate::graph::TaskKey;
use crate::registry::ComponentKind;

pub const RESULTS_FILE: &str = "results.json";
pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const ERROR_FILE: &str = "error.txt";
pub const SUCCESS_FILE: &str = "_SUCCESS";
pub const STATE_DIR: &str = "state";
/// Scratch directory a stage writes its raw outputs into.
pub const OUTPUT_DIR: &str = ".output";

/// Length of source and upstream digests in directory names.
const DIGEST_PREFIX_LEN: usize = 12;
/// Length of the disambiguating digest appended to rewritten names.
const NAME_DIGEST_LEN: usize = 8;

fn unsafe_segment_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("valid regex"))
}

/// Maps a name onto a single safe path segment.
pub fn sanitize_segment(name: &str) -> String {
    let cleaned = unsafe_segment_chars().replace_all(name, "_");
    match cleaned.as_ref() {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}

/// Maps a name onto a path segment that no other name maps onto.
///
/// Names that are already safe are kept as is. Anything rewritten by
/// `sanitize_segment` gets a digest of the original name appended, so
/// `voc 2012` and `voc_2012` land in different directories.
pub fn unique_segment(name: &str) -> String {
    let cleaned = sanitize_segment(name);
    if cleaned == name {
        return cleaned;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}-{}", cleaned, &digest[..NAME_DIGEST_LEN])
}

/// Computes artifact locations below a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory name identifying one combination of fingerprints.
    pub fn fingerprint_segment(
        revision: &Fingerprint,
        source: &Fingerprint,
        upstream: Option<&Fingerprint>,
    ) -> String {
        let mut segment = format!("{}-{}", revision, source.short(DIGEST_PREFIX_LEN));
        if let Some(upstream) = upstream {
            segment.push('-');
            segment.push_str(upstream.short(DIGEST_PREFIX_LEN));
        }
        sanitize_segment(&segment)
    }

    /// The artifact directory of one task at one fingerprint.
    pub fn task_dir(&self, kind: ComponentKind, key: &TaskKey, fingerprint: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}", kind, key.stage.artifact_suffix()))
            .join(unique_segment(&key.pipeline))
            .join(unique_segment(&key.interpreter))
            .join(unique_segment(&key.dataset))
            .join(unique_segment(&key.component))
            .join(fingerprint)
    }

    /// Where cycle metrics are written in text exposition format.
    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("metrics.prom")
    }
}

/// Creates `dir` and any missing parents. Existing directories are fine.
pub async fn ensure_dir(dir: &Path) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| PersistenceError::Write {
            path: dir.to_path_buf(),
            source,
        })
}

/// Writes `data` to `path` through a temporary sibling and a rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Err(e) = fs::write(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    Ok(())
}

pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &data).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let data = fs::read(path).await.map_err(|source| PersistenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Persists a failure diagnostic inside the task's artifact directory.
pub async fn write_error(dir: &Path, detail: &str) -> Result<(), PersistenceError> {
    ensure_dir(dir).await?;
    write_atomic(&dir.join(ERROR_FILE), detail.as_bytes()).await
}

/// Removes the diagnostic of an earlier failed attempt, if any.
pub async fn clear_error(dir: &Path) -> Result<(), PersistenceError> {
    let path = dir.join(ERROR_FILE);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistenceError::Write { path, source }),
    }
}

/// Marks a task directory as the output of a recorded, successful run.
pub async fn mark_success(dir: &Path) -> Result<(), PersistenceError> {
    write_atomic(&dir.join(SUCCESS_FILE), Utc::now().to_rfc3339().as_bytes()).await
}

/// Withdraws the success marker before a directory is rewritten.
pub async fn clear_success(dir: &Path) -> Result<(), PersistenceError> {
    let path = dir.join(SUCCESS_FILE);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistenceError::Write { path, source }),
    }
}

/// True when a task directory holds the outputs of a successful run.
pub async fn is_complete(dir: &Path) -> bool {
    for file in [SUCCESS_FILE, RESULTS_FILE, PREDICTIONS_FILE] {
        if !fs::try_exists(dir.join(file)).await.unwrap_or(false) {
            return false;
        }
    }
    true
}
