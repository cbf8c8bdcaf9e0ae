//! abstract-pool: priority worker pool and search index client for
//! scientific abstracts.
//!
//! A supervisor keeps a fixed number of worker processes alive, each bound
//! to a subset of the `HIGH`/`MEDIUM`/`LOW` job queues. Workers run jobs
//! against an abstracts index (Elasticsearch in production) to post,
//! delete, search and annotate documents.

pub mod cli;
pub mod error;
pub mod index;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use error::{IndexError, IndexResult};
pub use index::{Abstract, DeleteTarget, DocumentIndex, ElasticIndex, IndexConfig, MemoryIndex, Pmid};
pub use scheduler::{
    assign_queue_names, JobPriority, PoolSupervisor, PriorityCounts, QueueAssignment,
    SupervisorConfig, SupervisorError,
};
