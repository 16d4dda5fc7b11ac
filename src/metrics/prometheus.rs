//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by mlops-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all mlops-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks executed, labeled by component kind, stage, and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by component kind and stage.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total scheduling cycles, labeled by status.
pub static CYCLES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of stale tasks found by the last cycle.
pub static STALE_TASKS: OnceLock<IntGauge> = OnceLock::new();

/// Number of pipelines excluded from the last cycle.
pub static PIPELINES_EXCLUDED: OnceLock<IntGauge> = OnceLock::new();

/// Number of workers currently executing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    static INIT: Mutex<()> = Mutex::new(());
    let _guard = INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("mlops_forge_tasks_total", "Total number of tasks executed"),
        &["kind", "stage", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "mlops_forge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        &["kind", "stage"],
    )?;

    let cycles_total = CounterVec::new(
        Opts::new("mlops_forge_cycles_total", "Total scheduling cycles"),
        &["status"],
    )?;

    let stale_tasks = IntGauge::new(
        "mlops_forge_stale_tasks",
        "Number of stale tasks found by the last cycle",
    )?;

    let pipelines_excluded = IntGauge::new(
        "mlops_forge_pipelines_excluded",
        "Number of pipelines excluded from the last cycle",
    )?;

    let active_workers = Gauge::new("mlops_forge_active_workers", "Number of active workers")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(cycles_total.clone()))?;
    registry.register(Box::new(stale_tasks.clone()))?;
    registry.register(Box::new(pipelines_excluded.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = CYCLES_TOTAL.set(cycles_total);
    let _ = STALE_TASKS.set(stale_tasks);
    let _ = PIPELINES_EXCLUDED.set(pipelines_excluded);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to `path` for a node-exporter textfile collector.
///
/// The file is replaced atomically so a scraper never reads a partial write.
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, export_metrics())?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(cycles) = CYCLES_TOTAL.get() {
            cycles.with_label_values(&["success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("mlops_forge_cycles_total"));
    }

    #[test]
    fn test_write_textfile() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("metrics.prom");

        write_textfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("mlops_forge"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
