//! Error types for abstract-pool operations.
//!
//! Scheduler components define their own errors next to the code that
//! raises them (`QueueError`, `SupervisorError`, `WorkerError`); this module
//! holds the document index taxonomy shared by every index backend.

use thiserror::Error;

use crate::index::Pmid;

/// Errors returned by the document index client.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The search backend could not be reached. Not retried internally.
    #[error("Search backend unreachable: {0}")]
    Connection(String),

    #[error("Document {0} not found")]
    NotFound(Pmid),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend answered with an unexpected error status.
    #[error("Search backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Failed to parse search backend response: {0}")]
    Parse(String),
}

impl IndexError {
    /// Returns whether the error means the backend itself is unavailable.
    pub fn is_connection(&self) -> bool {
        matches!(self, IndexError::Connection(_))
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Parse(e.to_string())
    }
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
