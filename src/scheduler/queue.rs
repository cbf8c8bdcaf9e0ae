//! Redis-backed priority job queues with reliable dequeue.
//!
//! Each tier is its own Redis list, named after the tier:
//!
//! - `{TIER}`: jobs waiting to be processed (`HIGH`, `MEDIUM`, `LOW`)
//! - `{TIER}:processing:{slot}`: jobs taken by the worker in `slot` but not
//!   yet finished
//! - `{TIER}:dead_letter`: jobs that failed after their last attempt
//! - `jobs:results:{id}`: stored job results
//!
//! # Reliability
//!
//! A dequeue atomically moves the job from the tier list to the slot's
//! processing list (RPOPLPUSH). If a worker crashes mid-job the entry stays
//! there until the supervisor relaunches the same slot, whose new worker
//! requeues it. Workers in other slots never touch it, so a restart cannot
//! hand out a job that a live worker is still running.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::job::{Job, JobResult};
use super::priority::{JobPriority, QueueAssignment};

/// How long job results are kept (7 days).
const RESULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// No result is stored for the job.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}

fn processing_list(priority: JobPriority, slot: usize) -> String {
    format!("{}:processing:{}", priority.name(), slot)
}

fn processing_pattern(priority: JobPriority) -> String {
    format!("{}:processing:*", priority.name())
}

fn dead_letter_list(priority: JobPriority) -> String {
    format!("{}:dead_letter", priority.name())
}

fn result_key(job_id: Uuid) -> String {
    format!("jobs:results:{}", job_id)
}

fn dead_letter_entry<T: Serialize + ?Sized>(job: &T, error: &str) -> Result<String, QueueError> {
    let entry = serde_json::json!({
        "job": job,
        "error": error,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    });
    Ok(serde_json::to_string(&entry)?)
}

/// What a restarted slot does with an entry left in its processing list.
#[derive(Debug)]
enum Recovery {
    /// Back onto the tier, with the interrupted run counted as an attempt.
    Requeue(Job),
    /// The interrupted run was the job's last attempt.
    DeadLetter(Job),
    /// Not a job at all.
    Malformed(serde_json::Error),
}

fn plan_recovery(job_data: &str) -> Recovery {
    match serde_json::from_str::<Job>(job_data) {
        Ok(mut job) => {
            job.increment_attempts();
            if job.should_retry() {
                Recovery::Requeue(job)
            } else {
                Recovery::DeadLetter(job)
            }
        }
        Err(e) => Recovery::Malformed(e),
    }
}

/// The `HIGH`/`MEDIUM`/`LOW` job queues on one Redis server.
#[derive(Clone)]
pub struct PriorityQueues {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl PriorityQueues {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates the queues from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Enqueues a job on the list for its priority.
    ///
    /// Jobs are pushed on the left and taken from the right (FIFO).
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(job.priority.name(), serialized).await?;
        Ok(())
    }

    /// Takes the next job from the tiers in `assignment`, highest tier first,
    /// into the processing list of `slot`.
    ///
    /// Returns `Ok(None)` when every assigned tier is empty; the caller
    /// decides how long to wait before asking again.
    pub async fn dequeue(
        &self,
        slot: usize,
        assignment: &QueueAssignment,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();

        for priority in assignment.priorities() {
            let data: Option<String> = conn
                .rpoplpush(priority.name(), processing_list(priority, slot))
                .await?;

            if let Some(data) = data {
                let job: Job = serde_json::from_str(&data)?;
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Stores the job's result and removes it from the slot's processing list.
    pub async fn complete(
        &self,
        slot: usize,
        job: &Job,
        result: &JobResult,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result_data = serde_json::to_string(result)?;
        conn.set_ex::<_, _, ()>(result_key(job.id), &result_data, RESULT_TTL_SECS).await?;

        self.remove_job_from_processing(slot, job.priority, job.id).await?;

        Ok(())
    }

    /// Returns a job to the front of its tier for another attempt.
    ///
    /// The job's attempt counter should be incremented before calling this.
    pub async fn requeue(&self, slot: usize, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        self.remove_job_from_processing(slot, job.priority, job.id).await?;

        // RPUSH puts it where the next dequeue will find it first.
        let serialized = serde_json::to_string(job)?;
        conn.rpush::<_, _, ()>(job.priority.name(), serialized).await?;

        Ok(())
    }

    /// Moves a job to its tier's dead letter list after its last attempt.
    pub async fn dead_letter(&self, slot: usize, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        self.remove_job_from_processing(slot, job.priority, job.id).await?;

        let serialized = dead_letter_entry(job, error)?;

        conn.lpush::<_, _, ()>(dead_letter_list(job.priority), serialized).await?;

        Ok(())
    }

    /// Returns the number of jobs waiting on a tier.
    pub async fn len(&self, priority: JobPriority) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(priority.name()).await?;
        Ok(len)
    }

    /// Retrieves a job result by job ID.
    pub async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(result_key(job_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Requeues jobs a dead worker left in the processing lists of `slot`.
    ///
    /// Called when a worker starts. Each recovered job counts as an attempt;
    /// jobs out of attempts, and entries that are not jobs, go to the dead
    /// letter list instead. Processing lists of other slots are untouched.
    ///
    /// # Returns
    ///
    /// The number of jobs requeued.
    pub async fn recover_processing_jobs(
        &self,
        slot: usize,
        assignment: &QueueAssignment,
    ) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        for priority in assignment.priorities() {
            let processing = processing_list(priority, slot);
            let jobs: Vec<String> = conn.lrange(&processing, 0, -1).await?;

            for job_data in jobs {
                let mut pipe = redis::pipe();
                pipe.atomic().lrem(&processing, 1, &job_data);

                match plan_recovery(&job_data) {
                    Recovery::Requeue(job) => {
                        // Requeued jobs go where the next dequeue finds them first.
                        pipe.rpush(priority.name(), serde_json::to_string(&job)?);
                        recovered += 1;
                    }
                    Recovery::DeadLetter(job) => {
                        let entry = dead_letter_entry(
                            &job,
                            "Recovered from processing queue after max attempts",
                        )?;
                        pipe.lpush(dead_letter_list(priority), entry);
                    }
                    Recovery::Malformed(e) => {
                        warn!(
                            slot = slot,
                            list = %processing,
                            error = %e,
                            "Unreadable entry in processing list, moving to dead letter queue"
                        );
                        let reason = format!("Unreadable job: {}", e);
                        let entry = dead_letter_entry(job_data.as_str(), &reason)?;
                        pipe.lpush(dead_letter_list(priority), entry);
                    }
                }

                pipe.query_async::<_, ()>(&mut conn).await?;
            }
        }

        Ok(recovered)
    }

    /// Returns per-tier queue statistics.
    pub async fn stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let mut conn = self.redis.clone();
        let mut stats = Vec::with_capacity(JobPriority::ALL.len());

        for priority in JobPriority::ALL {
            let (pending, dead): (usize, usize) = redis::pipe()
                .llen(priority.name())
                .llen(dead_letter_list(priority))
                .query_async(&mut conn)
                .await?;

            let processing_lists: Vec<String> = conn.keys(processing_pattern(priority)).await?;
            let mut processing = 0;
            for list in &processing_lists {
                processing += conn.llen::<_, usize>(list).await?;
            }

            stats.push(QueueStats {
                priority,
                pending_jobs: pending,
                processing_jobs: processing,
                dead_letter_jobs: dead,
            });
        }

        Ok(stats)
    }

    /// Helper to remove a job from a slot's processing list by ID.
    async fn remove_job_from_processing(
        &self,
        slot: usize,
        priority: JobPriority,
        job_id: Uuid,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let processing = processing_list(priority, slot);

        let jobs: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&processing, 1, &job_data).await?;
                    return Ok(());
                }
            }
        }

        // Job not found is not an error - it might have been already removed
        Ok(())
    }
}

/// Statistics about one tier.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub priority: JobPriority,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed, over every slot.
    pub processing_jobs: usize,
    /// Number of jobs in the dead letter list.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs on this tier.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

/// Blocks until Redis answers a PING or the attempts run out.
pub async fn wait_for_redis(
    redis_url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<PriorityQueues, QueueError> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match PriorityQueues::connect(redis_url).await {
            Ok(queues) => {
                let mut conn = queues.redis.clone();
                match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                    Ok(_) => return Ok(queues),
                    Err(e) => last_error = Some(QueueError::RedisError(e)),
                }
            }
            Err(e) => last_error = Some(e),
        }
        tracing::info!(attempt = attempt, "Waiting for Redis to start up");
        tokio::time::sleep(delay).await;
    }
    Err(last_error.unwrap_or_else(|| QueueError::ConnectionFailed(redis_url.to_string())))
}
