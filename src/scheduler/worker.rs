//! Worker runtime: pulls jobs from its assigned priority queues and runs
//! them against the abstracts index.
//!
//! Each worker process runs one [`Worker`]. The supervisor gives it a slot
//! index and a [`QueueAssignment`]; the worker only ever consumes from those
//! queues, highest tier first.
//!
//! # Features
//!
//! - Crash recovery of jobs a dead predecessor in the same slot left behind
//! - Per-job timeout
//! - Automatic job retry on failure, dead letter list after the last attempt
//! - Graceful shutdown with broadcast channel

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::IndexError;
use crate::index::{DeleteTarget, DocumentIndex};
use crate::metrics::{write_textfile, MetricsCollector};

use super::job::{Job, JobPayload, JobResult, JobStatus};
use super::priority::QueueAssignment;
use super::queue::{PriorityQueues, QueueError};

/// Default time allowed for a single job (12 hours).
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Errors raised while processing a job.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Index operation failed: {0}")]
    Index(#[from] IndexError),

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

/// Executes the payload of a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job and returns its JSON output.
    async fn handle(&self, job: &Job) -> Result<Value, WorkerError>;
}

/// Runs job payloads against a [`DocumentIndex`].
pub struct IndexJobHandler<I: ?Sized> {
    index: Arc<I>,
}

impl<I: DocumentIndex + ?Sized> IndexJobHandler<I> {
    pub fn new(index: Arc<I>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl<I: DocumentIndex + ?Sized> JobHandler for IndexJobHandler<I> {
    async fn handle(&self, job: &Job) -> Result<Value, WorkerError> {
        match &job.payload {
            JobPayload::PostAbstracts { abstracts } => {
                self.index.post(abstracts).await?;
                Ok(json!({ "posted": abstracts.len() }))
            }
            JobPayload::DeleteAbstracts { target } => {
                self.index.delete(target).await?;
                let deleted = match target {
                    DeleteTarget::All => json!("all"),
                    DeleteTarget::Ids(ids) => json!(ids.len()),
                };
                Ok(json!({ "deleted": deleted }))
            }
            JobPayload::AddCitationCounts { counts } => {
                self.index.add_citation_counts(counts).await?;
                Ok(json!({ "updated": counts.len() }))
            }
            JobPayload::Search { queries } => {
                let results = self.index.multi_search(queries).await?;
                Ok(serde_json::to_value(results).map_err(IndexError::from)?)
            }
        }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Slot index given by the supervisor.
    pub slot: usize,
    /// Queues this worker consumes from.
    pub queues: QueueAssignment,
    /// How long to wait before polling again when every queue is empty.
    pub poll_interval: Duration,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Directory for the `worker-{slot}.prom` metrics snapshot.
    pub metrics_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            queues: QueueAssignment::All,
            poll_interval: Duration::from_secs(1),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            metrics_dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(slot: usize, queues: QueueAssignment) -> Self {
        Self {
            slot,
            queues,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_metrics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metrics_dir = Some(dir.into());
        self
    }

    /// Identifier recorded in job results and logs.
    pub fn worker_id(&self) -> String {
        format!("worker-{}", self.slot)
    }
}

/// Counters for the jobs a worker has processed.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    total_duration: Duration,
}

impl WorkerStats {
    fn record(&mut self, status: JobStatus, duration: Duration) {
        match status {
            JobStatus::Completed => self.jobs_completed += 1,
            JobStatus::Failed => self.jobs_failed += 1,
            JobStatus::Timeout => self.jobs_timed_out += 1,
        }
        self.total_duration += duration;
    }

    /// Returns the total number of jobs processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_timed_out
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }

    pub fn average_job_duration(&self) -> Duration {
        match u32::try_from(self.total_processed()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(total) => self.total_duration / total,
        }
    }
}

/// Runs `handler` on `job`, bounded by `timeout`.
pub async fn execute_with_timeout(
    handler: &dyn JobHandler,
    job: &Job,
    timeout: Duration,
) -> Result<Value, WorkerError> {
    match tokio::time::timeout(timeout, handler.handle(job)).await {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Timeout(timeout)),
    }
}

/// A worker that processes jobs from its assigned queues.
pub struct Worker {
    id: String,
    config: WorkerConfig,
    queues: Arc<PriorityQueues>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: WorkerStats,
    metrics: MetricsCollector,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queues: Arc<PriorityQueues>,
        handler: Arc<dyn JobHandler>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id: config.worker_id(),
            config,
            queues,
            handler,
            shutdown_rx,
            stats: WorkerStats::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Main worker loop.
    ///
    /// Polls the assigned queues and processes jobs until a shutdown signal
    /// is received. A job in progress is always finished first.
    pub async fn run(mut self) -> WorkerStats {
        info!(worker_id = %self.id, queues = %self.config.queues, "Worker started");

        match self.queues.recover_processing_jobs(self.config.slot, &self.config.queues).await {
            Ok(recovered) if recovered > 0 => {
                info!(
                    worker_id = %self.id,
                    recovered = recovered,
                    "Recovered jobs from processing queue"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(worker_id = %self.id, error = %e, "Failed to recover processing jobs"),
        }

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queues.dequeue(self.config.slot, &self.config.queues).await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    self.publish_metrics().await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    if self.wait_or_shutdown().await {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    if self.wait_or_shutdown().await {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.id,
            processed = self.stats.total_processed(),
            "Worker stopped"
        );
        self.stats
    }

    /// Sleeps one poll interval. Returns true if shutdown arrived meanwhile.
    async fn wait_or_shutdown(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    /// Processes a single job.
    async fn process_job(&mut self, mut job: Job) {
        let job_id = job.id;
        let slot = self.config.slot;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = job.payload.kind(),
            priority = %job.priority,
            attempt = job.attempts + 1,
            "Processing job"
        );

        job.increment_attempts();

        let result =
            execute_with_timeout(self.handler.as_ref(), &job, self.config.job_timeout).await;
        let duration = start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;

        let status = match result {
            Ok(output) => {
                let job_result = JobResult::success(job_id, &self.id, output, duration_ms);
                if let Err(e) = self.queues.complete(slot, &job, &job_result).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job complete");
                }
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration_ms,
                    "Job completed successfully"
                );
                JobStatus::Completed
            }
            Err(WorkerError::Timeout(limit)) => {
                let job_result = JobResult::timeout(job_id, &self.id, duration_ms);
                if let Err(e) = self.queues.complete(slot, &job, &job_result).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to record job timeout");
                }
                warn!(worker_id = %self.id, job_id = %job_id, limit = ?limit, "Job timed out");
                JobStatus::Timeout
            }
            Err(e) => {
                if job.should_retry() {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        remaining_attempts = job.remaining_attempts(),
                        "Job failed, requeueing for retry"
                    );

                    if let Err(requeue_err) = self.queues.requeue(slot, &job).await {
                        error!(worker_id = %self.id, job_id = %job_id, error = %requeue_err, "Failed to requeue job");
                    }
                } else {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Job failed, moving to dead letter queue"
                    );

                    if let Err(dlq_err) = self.queues.dead_letter(slot, &job, &e.to_string()).await {
                        error!(worker_id = %self.id, job_id = %job_id, error = %dlq_err, "Failed to move job to dead letter queue");
                    }
                }
                JobStatus::Failed
            }
        };

        self.stats.record(status, duration);
        self.metrics
            .record_job(&status.to_string(), job.priority.name(), duration.as_secs_f64());
    }

    /// Refreshes queue depth gauges and writes the metrics snapshot.
    async fn publish_metrics(&self) {
        for priority in self.config.queues.priorities() {
            match self.queues.len(priority).await {
                Ok(depth) => self.metrics.update_queue_depth(priority.name(), depth),
                Err(e) => debug!(worker_id = %self.id, error = %e, "Failed to read queue depth"),
            }
        }

        if let Some(dir) = &self.config.metrics_dir {
            let path = dir.join(format!("{}.prom", self.id));
            if let Err(e) = write_textfile(&path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics snapshot");
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Abstract, MemoryIndex, Pmid};
    use crate::scheduler::JobPriority;
    use std::collections::BTreeMap;

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, WorkerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn job(payload: JobPayload) -> Job {
        Job::new(JobPriority::Medium, payload)
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.slot, 0);
        assert_eq!(config.queues, QueueAssignment::All);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(43200));
        assert!(config.metrics_dir.is_none());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new(3, QueueAssignment::Single(JobPriority::Low))
            .with_poll_interval(Duration::from_millis(250))
            .with_job_timeout(Duration::from_secs(60))
            .with_metrics_dir("/var/lib/node_exporter");

        assert_eq!(config.worker_id(), "worker-3");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert_eq!(
            config.metrics_dir,
            Some(PathBuf::from("/var/lib/node_exporter"))
        );
    }

    #[test]
    fn test_worker_stats() {
        let mut stats = WorkerStats::default();
        assert_eq!(stats.average_job_duration(), Duration::ZERO);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);

        stats.record(JobStatus::Completed, Duration::from_secs(10));
        stats.record(JobStatus::Completed, Duration::from_secs(20));
        stats.record(JobStatus::Failed, Duration::from_secs(3));
        stats.record(JobStatus::Timeout, Duration::from_secs(7));

        assert_eq!(stats.total_processed(), 4);
        assert_eq!(stats.average_job_duration(), Duration::from_secs(10));
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_index_handler_runs_payloads() {
        let index = Arc::new(MemoryIndex::new());
        let handler = IndexJobHandler::new(Arc::clone(&index));

        let posted = handler
            .handle(&job(JobPayload::PostAbstracts {
                abstracts: vec![
                    Abstract::new(1u64, "Metformin and aging", "Cohort study"),
                    Abstract::new(2u64, "Statins", "Metformin was not used"),
                ],
            }))
            .await
            .expect("post should succeed");
        assert_eq!(posted, json!({ "posted": 2 }));

        let mut counts = BTreeMap::new();
        counts.insert(Pmid(2), 11);
        let updated = handler
            .handle(&job(JobPayload::AddCitationCounts { counts }))
            .await
            .expect("citation update should succeed");
        assert_eq!(updated, json!({ "updated": 1 }));
        assert_eq!(
            index.get(Pmid(2)).await.expect("present").citation_count,
            Some(11)
        );

        let found = handler
            .handle(&job(JobPayload::Search {
                queries: vec!["metformin".to_string()],
            }))
            .await
            .expect("search should succeed");
        let hits = found["metformin"].as_array().expect("hits array");
        assert_eq!(hits.len(), 2);

        let deleted = handler
            .handle(&job(JobPayload::DeleteAbstracts {
                target: DeleteTarget::All,
            }))
            .await
            .expect("delete should succeed");
        assert_eq!(deleted, json!({ "deleted": "all" }));
        assert!(!index.exists());
    }

    #[tokio::test]
    async fn test_index_handler_surfaces_not_found() {
        let index = Arc::new(MemoryIndex::new());
        let handler = IndexJobHandler::new(index);

        let mut counts = BTreeMap::new();
        counts.insert(Pmid(404), 1);
        let err = handler
            .handle(&job(JobPayload::AddCitationCounts { counts }))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Index(IndexError::NotFound(Pmid(404)))));
    }

    #[tokio::test]
    async fn test_execute_with_timeout() {
        let err = execute_with_timeout(
            &SlowHandler,
            &job(JobPayload::Search { queries: vec![] }),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::Timeout(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
