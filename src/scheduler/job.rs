//! Job definitions for the scheduler.
//!
//! - `Job`: a unit of work queued on one priority tier
//! - `JobPayload`: the index operation the job performs
//! - `JobResult`: outcome recorded by the worker
//! - `JobStatus`: final status of a finished job

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::priority::JobPriority;
use crate::index::{Abstract, DeleteTarget, Pmid};

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Work a job asks a worker to perform against the abstracts index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Upsert abstracts by PMID.
    PostAbstracts { abstracts: Vec<Abstract> },
    /// Remove abstracts, or drop the whole index with `"all"`.
    DeleteAbstracts { target: DeleteTarget },
    /// Merge citation counts into already indexed abstracts.
    AddCitationCounts { counts: BTreeMap<Pmid, u64> },
    /// Run a batch of free-text queries; the result maps query to PMIDs.
    Search { queries: Vec<String> },
}

impl JobPayload {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::PostAbstracts { .. } => "post_abstracts",
            JobPayload::DeleteAbstracts { .. } => "delete_abstracts",
            JobPayload::AddCitationCounts { .. } => "add_citation_counts",
            JobPayload::Search { .. } => "search",
        }
    }
}

/// A job representing a unit of work to be executed.
///
/// Jobs are stored in the Redis list named after their priority and
/// processed by any worker whose slot serves that tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Tier the job is queued on.
    pub priority: JobPriority,
    /// The work to perform.
    pub payload: JobPayload,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// Number of times this job has been attempted.
    pub attempts: u32,
    /// Maximum number of attempts before moving to dead letter queue.
    pub max_attempts: u32,
    /// Optional metadata for tracking and debugging.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Job {
    /// Creates a new job with zero attempts and the default attempt limit.
    pub fn new(priority: JobPriority, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metadata: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets optional metadata for the job.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Increments the attempt counter.
    ///
    /// This should be called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the job should be retried after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Status of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job completed successfully.
    Completed,
    /// Job failed after exhausting all attempts.
    Failed,
    /// Job timed out during execution.
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of a job execution, stored in Redis for later retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: Uuid,
    /// Final status of the job.
    pub status: JobStatus,
    /// Output produced by the job (search results, counts).
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Error message if the job failed.
    pub error: Option<String>,
    /// When the job finished.
    pub completed_at: DateTime<Utc>,
    /// ID of the worker that processed this job.
    pub worker_id: String,
    /// Duration of the execution in milliseconds.
    pub duration_ms: u64,
}

impl JobResult {
    /// Creates a new successful job result.
    pub fn success(
        job_id: Uuid,
        worker_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            output: Some(output),
            error: None,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Creates a new failed job result.
    pub fn failure(
        job_id: Uuid,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            output: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Creates a new timeout job result.
    pub fn timeout(job_id: Uuid, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Timeout,
            output: None,
            error: Some("Job execution timed out".to_string()),
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Returns whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
