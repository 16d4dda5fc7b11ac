//! Error types shared across the scheduling subsystems.
//!
//! Each enum maps onto one failure class of a scheduling cycle:
//! - Source synchronization (`SyncError`): isolates to one pipeline
//! - Manifest resolution (`ManifestError`): isolates to one pipeline
//! - Fingerprinting (`FingerprintError`): isolates to one component
//! - Stage execution (`ExecutionError`): isolates to one task
//! - Artifact and history persistence (`PersistenceError`): isolates to one task
//!
//! Cycle-level errors live next to the coordinator, configuration errors next
//! to the configuration loader.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while synchronizing a pipeline's source tree.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid pipeline locator '{0}'")]
    InvalidLocator(String),

    #[error("Command `{command}` failed for '{locator}': {stderr}")]
    CommandFailed {
        locator: String,
        command: String,
        stderr: String,
    },

    #[error("Pipeline source directory does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving a pipeline manifest into components.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse manifest '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Empty {0} name in manifest")]
    EmptyName(String),

    #[error("Duplicate {kind} '{name}' in manifest")]
    DuplicateComponent { kind: String, name: String },

    #[error("Invalid {kind} name '{name}' in manifest: use letters, digits, '_', '.' or '-'")]
    InvalidName { kind: String, name: String },

    #[error("{kind} '{name}' declares no sources")]
    NoSources { kind: String, name: String },

    #[error("Pipeline name '{0}' is already provided by an earlier locator")]
    DuplicatePipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A component whose defining source cannot be located or read.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Component '{component}' is unresolvable: source '{path}' not found")]
    SourceNotFound { component: String, path: PathBuf },

    #[error("Component '{component}' is unresolvable: source '{path}' escapes the pipeline root")]
    OutsideRoot { component: String, path: PathBuf },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk '{path}': {message}")]
    Walk { path: PathBuf, message: String },
}

/// Errors raised by a stage execution collaborator.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Component '{0}' declares no command to run")]
    NoCommand(String),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with status {code:?}\n--- stderr ---\n{stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Stage did not produce '{0}'")]
    MissingOutput(PathBuf),

    #[error("Malformed stage output '{path}': {message}")]
    MalformedOutput { path: PathBuf, message: String },

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while writing artifacts or history for a task.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("History error: {0}")]
    History(#[from] crate::history::HistoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::CommandFailed {
            locator: "https://example.com/obj_det.git".to_string(),
            command: "git pull".to_string(),
            stderr: "fatal: unable to access".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("git pull"));
        assert!(text.contains("obj_det.git"));
        assert!(text.contains("unable to access"));
    }

    #[test]
    fn test_fingerprint_error_display() {
        let err = FingerprintError::SourceNotFound {
            component: "yolo".to_string(),
            path: PathBuf::from("models/yolo.py"),
        };
        assert!(err.to_string().contains("unresolvable"));
        assert!(err.to_string().contains("models/yolo.py"));
    }

    #[test]
    fn test_execution_error_keeps_stderr() {
        let err = ExecutionError::NonZeroExit {
            code: Some(2),
            stderr: "Traceback (most recent call last)".to_string(),
        };
        assert!(err.to_string().contains("Some(2)"));
        assert!(err.to_string().contains("Traceback"));
    }

    #[test]
    fn test_manifest_error_display() {
        let err = ManifestError::DuplicateComponent {
            kind: "model".to_string(),
            name: "yolo".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate model 'yolo' in manifest");
    }
}
