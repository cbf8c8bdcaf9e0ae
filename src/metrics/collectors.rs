//! Custom metric collectors for abstract-pool operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with methods for the
//! events the supervisor, the workers and the index client report. Every
//! method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    INDEX_LATENCY, INDEX_REQUESTS_TOTAL, JOBS_TOTAL, JOB_DURATION, LIVE_WORKERS, QUEUE_DEPTH,
    SPAWN_FAILURES_TOTAL, WORKER_RESTARTS_TOTAL,
};

/// Metrics collector for recording operational metrics.
///
/// # Example
///
/// ```ignore
/// use abstract_pool::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_worker_restart("HIGH");
/// collector.record_job("completed", "LOW", 1.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Set the number of slots with a live worker process.
    pub fn update_live_workers(&self, count: usize) {
        if let Some(live_workers) = LIVE_WORKERS.get() {
            live_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated live workers metric");
    }

    /// Record a worker process relaunched into its slot.
    ///
    /// # Arguments
    ///
    /// * `queues` - Queue assignment of the slot (e.g. "HIGH" or "HIGH,MEDIUM,LOW")
    pub fn record_worker_restart(&self, queues: &str) {
        if let Some(restarts) = WORKER_RESTARTS_TOTAL.get() {
            restarts.with_label_values(&[queues]).inc();
        }

        tracing::trace!(queues = queues, "Recorded worker restart metric");
    }

    /// Record a failed attempt to spawn a worker process.
    pub fn record_spawn_failure(&self) {
        if let Some(failures) = SPAWN_FAILURES_TOTAL.get() {
            failures.inc();
        }
    }

    /// Record a finished job.
    ///
    /// # Arguments
    ///
    /// * `status` - Job status (e.g. "completed", "failed", "timeout")
    /// * `priority` - Queue the job came from
    /// * `duration_secs` - Execution time in seconds
    pub fn record_job(&self, status: &str, priority: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status, priority]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[priority])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            priority = priority,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Update the queue depth for a priority queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Record a request to the search backend.
    ///
    /// # Arguments
    ///
    /// * `operation` - Index operation (e.g. "search", "post", "update")
    /// * `success` - Whether the backend answered without error
    /// * `latency_secs` - Round-trip time in seconds
    pub fn record_index_request(&self, operation: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = INDEX_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[operation, status]).inc();
        }

        if let Some(latency) = INDEX_LATENCY.get() {
            latency
                .with_label_values(&[operation])
                .observe(latency_secs);
        }

        tracing::trace!(
            operation = operation,
            status = status,
            latency_secs = latency_secs,
            "Recorded index request metric"
        );
    }
}
