//! Priority worker pool over Redis queues.
//!
//! - **PoolSupervisor**: keeps one worker process per slot alive
//! - **Worker**: pulls jobs from its assigned queues and runs them
//! - **PriorityQueues**: the `HIGH`/`MEDIUM`/`LOW` Redis lists with reliable dequeue
//! - **Job**: job definitions with retry logic and dead letter support
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (enqueue CLI)│
//!                      └──────┬───────┘
//!                             │
//!            ┌────────────────┼────────────────┐
//!            ▼                ▼                ▼
//!         ┌──────┐        ┌────────┐       ┌─────┐
//!         │ HIGH │        │ MEDIUM │       │ LOW │
//!         └──┬───┘        └───┬────┘       └──┬──┘
//!            │                │               │
//!            ▼                ▼               ▼
//!      ┌──────────┐     ┌──────────┐    ┌───────────────┐
//!      │ slot 0..h│     │ slot h.. │    │ remaining     │
//!      │  {HIGH}  │     │ {MEDIUM} │ .. │ slots: all    │
//!      └──────────┘     └──────────┘    └───────────────┘
//!                 ▲ respawned by the PoolSupervisor ▲
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use abstract_pool::scheduler::{
//!     PoolSupervisor, PriorityCounts, ProcessLauncher, SupervisorConfig,
//! };
//!
//! let config = SupervisorConfig::new(5).with_priorities(PriorityCounts::new(2, 1, 0));
//! let mut supervisor = PoolSupervisor::new(config, ProcessLauncher::current_exe()?)?;
//! supervisor.run().await;
//! ```

pub mod job;
pub mod priority;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use job::{Job, JobPayload, JobResult, JobStatus};
pub use priority::{assign_queue_names, JobPriority, PriorityCounts, QueueAssignment};
pub use queue::{wait_for_redis, PriorityQueues, QueueError, QueueStats};
pub use supervisor::{
    PoolSupervisor, ProcessHandle, ProcessLauncher, SlotStatus, SupervisorConfig,
    SupervisorError, SupervisorStats, SweepReport, WorkerHandle, WorkerLauncher,
};
pub use worker::{
    execute_with_timeout, IndexJobHandler, JobHandler, Worker, WorkerConfig, WorkerError,
    WorkerStats,
};
