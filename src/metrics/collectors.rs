//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library users
//! and tests that never initialize metrics pay nothing.

use super::prometheus::{
    ACTIVE_WORKERS, CYCLES_TOTAL, PIPELINES_EXCLUDED, STALE_TASKS, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording scheduler metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one task execution.
    ///
    /// # Arguments
    ///
    /// * `kind` - Component kind (`model`, `ensemble`)
    /// * `stage` - `train` or `test`
    /// * `outcome` - `succeeded`, `failed` or `deferred`
    /// * `duration_secs` - Wall-clock execution time
    pub fn record_task(&self, kind: &str, stage: &str, outcome: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[kind, stage, outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[kind, stage])
                .observe(duration_secs);
        }

        tracing::trace!(
            kind = kind,
            stage = stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record the end of a scheduling cycle.
    pub fn record_cycle(&self, status: &str, stale_tasks: usize, excluded_pipelines: usize) {
        if let Some(cycles) = CYCLES_TOTAL.get() {
            cycles.with_label_values(&[status]).inc();
        }
        if let Some(stale) = STALE_TASKS.get() {
            stale.set(stale_tasks as i64);
        }
        if let Some(excluded) = PIPELINES_EXCLUDED.get() {
            excluded.set(excluded_pipelines as i64);
        }
    }

    pub fn set_active_workers(&self, count: u64) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.set(count as f64);
        }
    }
}
