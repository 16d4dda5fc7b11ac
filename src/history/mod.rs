//! Durable record of the last fingerprint each task completed at.
//!
//! The store is the retry contract of the scheduler: it is written only after a
//! task's stage has fully succeeded, so anything missing or behind here is
//! stale and gets re-attempted.

mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

pub use store::HistoryStore;

/// Errors raised by the history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to open history store '{path}': {message}")]
    Open { path: String, message: String },

    #[error("History query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Unknown fingerprint axis '{0}'")]
    UnknownAxis(String),
}

/// One dimension of a task's fingerprint, tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// The pipeline's synchronized revision.
    Revision,
    /// The component's own defining source.
    Source,
    /// The source of every model an ensemble consumes.
    Upstream,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Revision => "revision",
            Axis::Source => "source",
            Axis::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revision" => Ok(Axis::Revision),
            "source" => Ok(Axis::Source),
            "upstream" => Ok(Axis::Upstream),
            other => Err(HistoryError::UnknownAxis(other.to_string())),
        }
    }
}

/// A stored fingerprint for one task key and axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_key: String,
    pub axis: Axis,
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}
