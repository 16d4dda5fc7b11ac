//! Experiment tracking collaborators.
//!
//! A run is opened per executed task, tagged with the pipeline revision,
//! receives the task's metrics and rendered artifacts, and is closed with
//! `SUCCESS` or `FAILED`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::artifacts::{sanitize_segment, write_json};
use crate::error::PersistenceError;

/// Tag holding the pipeline revision a run was produced from.
pub const COMMIT_TAG: &str = "COMMIT";
/// Tag holding the final run status.
pub const STATUS_TAG: &str = "LOG_STATUS";

/// Errors raised by a tracking backend.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Tracking persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Tracking backend error: {0}")]
    Backend(String),
}

/// Final status of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Opens tracked runs.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Starts a run in `experiment`, tagged with `revision`.
    async fn begin_run(
        &self,
        experiment: &str,
        run_name: &str,
        revision: &str,
    ) -> Result<Box<dyn TrackedRun>, TrackingError>;
}

/// One open run.
#[async_trait]
pub trait TrackedRun: Send {
    async fn log_metric(&mut self, name: &str, value: f64) -> Result<(), TrackingError>;

    async fn set_tag(&mut self, key: &str, value: &str) -> Result<(), TrackingError>;

    async fn log_artifacts(&mut self, dir: &Path) -> Result<(), TrackingError>;

    async fn end(self: Box<Self>, status: RunStatus) -> Result<(), TrackingError>;
}

/// Persisted form of a run, as written by `FileTracker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub experiment: String,
    pub run_name: String,
    pub status: RunStatus,
    pub tags: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Writes one JSON record per run to `{root}/{experiment}/{run_id}.json`.
#[derive(Debug, Clone)]
pub struct FileTracker {
    root: PathBuf,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ExperimentTracker for FileTracker {
    async fn begin_run(
        &self,
        experiment: &str,
        run_name: &str,
        revision: &str,
    ) -> Result<Box<dyn TrackedRun>, TrackingError> {
        let dir = self.root.join(sanitize_segment(experiment));
        super::artifacts::ensure_dir(&dir).await?;

        let run_id = Uuid::new_v4();
        let mut tags = BTreeMap::new();
        tags.insert(COMMIT_TAG.to_string(), revision.to_string());

        let run = FileRun {
            path: dir.join(format!("{}.json", run_id)),
            record: RunRecord {
                run_id,
                experiment: experiment.to_string(),
                run_name: run_name.to_string(),
                status: RunStatus::Running,
                tags,
                metrics: BTreeMap::new(),
                artifacts: Vec::new(),
                started_at: Utc::now(),
                ended_at: None,
            },
        };
        write_json(&run.path, &run.record).await?;

        tracing::debug!(experiment = experiment, run_name = run_name, run_id = %run_id, "Tracked run started");
        Ok(Box::new(run))
    }
}

struct FileRun {
    path: PathBuf,
    record: RunRecord,
}

#[async_trait]
impl TrackedRun for FileRun {
    async fn log_metric(&mut self, name: &str, value: f64) -> Result<(), TrackingError> {
        self.record.metrics.insert(name.to_string(), value);
        Ok(())
    }

    async fn set_tag(&mut self, key: &str, value: &str) -> Result<(), TrackingError> {
        self.record.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_artifacts(&mut self, dir: &Path) -> Result<(), TrackingError> {
        self.record.artifacts.push(dir.to_path_buf());
        Ok(())
    }

    async fn end(self: Box<Self>, status: RunStatus) -> Result<(), TrackingError> {
        let mut run = *self;
        run.record.status = status;
        run.record
            .tags
            .insert(STATUS_TAG.to_string(), status.to_string());
        run.record.ended_at = Some(Utc::now());
        write_json(&run.path, &run.record).await?;
        Ok(())
    }
}

/// Discards everything. For runs where tracking is not wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

struct NullRun;

#[async_trait]
impl ExperimentTracker for NullTracker {
    async fn begin_run(
        &self,
        _experiment: &str,
        _run_name: &str,
        _revision: &str,
    ) -> Result<Box<dyn TrackedRun>, TrackingError> {
        Ok(Box::new(NullRun))
    }
}

#[async_trait]
impl TrackedRun for NullRun {
    async fn log_metric(&mut self, _name: &str, _value: f64) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn set_tag(&mut self, _key: &str, _value: &str) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn log_artifacts(&mut self, _dir: &Path) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn end(self: Box<Self>, _status: RunStatus) -> Result<(), TrackingError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::artifacts::read_json;

    #[tokio::test]
    async fn test_file_tracker_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());

        let mut run = tracker.begin_run("obj_det", "train_yolo", "abc123").await.unwrap();
        run.log_metric("mAP", 0.42).await.unwrap();
        run.log_artifacts(Path::new("/tmp/viz")).await.unwrap();
        run.end(RunStatus::Success).await.unwrap();

        let files: Vec<PathBuf> = std::fs::read_dir(dir.path().join("obj_det"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);

        let record: RunRecord = read_json(&files[0]).await.unwrap();
        assert_eq!(record.run_name, "train_yolo");
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.tags.get(COMMIT_TAG).map(String::as_str), Some("abc123"));
        assert_eq!(record.tags.get(STATUS_TAG).map(String::as_str), Some("SUCCESS"));
        assert_eq!(record.metrics.get("mAP"), Some(&0.42));
        assert_eq!(record.artifacts, vec![PathBuf::from("/tmp/viz")]);
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn test_run_status_serde() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(RunStatus::Success.to_string(), "SUCCESS");
    }
}
