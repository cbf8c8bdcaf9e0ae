//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by abstract-pool and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

/// Global Prometheus registry for all abstract-pool metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of worker slots whose process is currently alive.
pub static LIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Worker processes relaunched after dying, labeled by queue assignment.
pub static WORKER_RESTARTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Failed attempts to spawn a worker process.
pub static SPAWN_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Jobs finished by workers, labeled by status and priority.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by priority.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs waiting in each priority queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Requests sent to the search backend, labeled by operation and status.
pub static INDEX_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Search backend request latency in seconds, labeled by operation.
pub static INDEX_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at process startup. Later calls leave the first registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Supervisor metrics
    let live_workers = Gauge::new(
        "abstract_pool_live_workers",
        "Number of worker slots with a live process",
    )?;

    let worker_restarts_total = CounterVec::new(
        Opts::new(
            "abstract_pool_worker_restarts_total",
            "Worker processes relaunched after dying",
        ),
        &["queues"],
    )?;

    let spawn_failures_total = Counter::new(
        "abstract_pool_spawn_failures_total",
        "Failed attempts to spawn a worker process",
    )?;

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("abstract_pool_jobs_total", "Jobs finished by workers"),
        &["status", "priority"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "abstract_pool_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0]),
        &["priority"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("abstract_pool_queue_depth", "Number of jobs in queue"),
        &["queue_name"],
    )?;

    // Search backend metrics
    let index_requests_total = CounterVec::new(
        Opts::new(
            "abstract_pool_index_requests_total",
            "Requests sent to the search backend",
        ),
        &["operation", "status"],
    )?;

    let index_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "abstract_pool_index_latency_seconds",
            "Search backend request latency in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["operation"],
    )?;

    registry.register(Box::new(live_workers.clone()))?;
    registry.register(Box::new(worker_restarts_total.clone()))?;
    registry.register(Box::new(spawn_failures_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(index_requests_total.clone()))?;
    registry.register(Box::new(index_latency.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = LIVE_WORKERS.set(live_workers);
    let _ = WORKER_RESTARTS_TOTAL.set(worker_restarts_total);
    let _ = SPAWN_FAILURES_TOTAL.set(spawn_failures_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = INDEX_REQUESTS_TOTAL.set(index_requests_total);
    let _ = INDEX_LATENCY.set(index_latency);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if the registry has not been
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

/// Writes the current metrics to `path` for a node_exporter textfile
/// collector. The file is replaced atomically so scrapes never see a partial
/// write.
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, export_metrics())?;
    std::fs::rename(&tmp, path)
}
