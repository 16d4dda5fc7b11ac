//! mlops-forge: incremental scheduler for multi-stage ML pipelines.
//!
//! Each cycle discovers pipelines, fingerprints their components, and runs
//! only the train/test stages whose revision, source or upstream fingerprint
//! moved since the last successful run.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod history;
pub mod metrics;
pub mod registry;
pub mod scheduler;

pub use config::{ConfigError, ForgeConfig};
pub use coordinator::{CycleError, CycleReport, CycleState, RunCoordinator};
pub use error::{ExecutionError, FingerprintError, ManifestError, PersistenceError, SyncError};
pub use fingerprint::Fingerprint;
pub use graph::{Stage, TaskKey};
pub use history::{Axis, HistoryStore};
