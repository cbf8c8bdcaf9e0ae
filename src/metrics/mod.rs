//! Prometheus metrics for the supervisor, workers and index client.
//!
//! Each process keeps its own registry. With `--metrics-dir` set, the
//! supervisor writes `supervisor.prom` after every sweep and each worker
//! writes `worker-{slot}.prom` after every job, ready for a node_exporter
//! textfile collector.
//!
//! # Example
//!
//! ```ignore
//! use abstract_pool::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().update_live_workers(4);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_textfile};

pub use prometheus::{
    INDEX_LATENCY, INDEX_REQUESTS_TOTAL, JOBS_TOTAL, JOB_DURATION, LIVE_WORKERS, QUEUE_DEPTH,
    REGISTRY, SPAWN_FAILURES_TOTAL, WORKER_RESTARTS_TOTAL,
};
