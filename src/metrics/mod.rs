//! Metrics module for Prometheus-based monitoring.
//!
//! Task outcomes, task durations, cycles and worker activity are recorded
//! here and written out in text exposition format after each cycle.
//!
//! # Example
//!
//! ```ignore
//! use mlops_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("model", "train", "succeeded", 120.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_textfile};

pub use prometheus::{
    ACTIVE_WORKERS, CYCLES_TOTAL, PIPELINES_EXCLUDED, REGISTRY, STALE_TASKS, TASKS_TOTAL,
    TASK_DURATION,
};
