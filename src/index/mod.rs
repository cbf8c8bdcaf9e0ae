//! Document index over the abstracts corpus.
//!
//! [`DocumentIndex`] is the contract workers use to read, write and search
//! abstracts. It is a stateless facade: documents live in the backend, every
//! call is independent, and implementations are safe to share between tasks.
//!
//! - [`ElasticIndex`]: Elasticsearch REST backend (production)
//! - [`MemoryIndex`]: in-process backend for inline runs and tests
//!
//! # Example
//!
//! ```rust,ignore
//! use abstract_pool::index::{Abstract, DocumentIndex, ElasticIndex, IndexConfig};
//!
//! let index = ElasticIndex::connect(IndexConfig::default()).await?;
//! index.post(&[Abstract::new(1u64, "Title", "Body text")]).await?;
//! let hits = index.search("body").await?;
//! ```

pub mod document;
pub mod elastic;
pub mod memory;
pub mod query;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::IndexResult;

pub use document::{Abstract, DeleteTarget, Pmid};
pub use elastic::ElasticIndex;
pub use memory::MemoryIndex;

/// Default index name for the abstracts corpus.
pub const DEFAULT_INDEX: &str = "pubmed_abstracts";

/// Read/write/search contract over a single abstracts collection.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Fetches one document. Fails with `NotFound` if it is absent.
    async fn get(&self, pmid: Pmid) -> IndexResult<Abstract>;

    /// Matches `query` against title and text; ids in relevance order.
    async fn search(&self, query: &str) -> IndexResult<Vec<Pmid>>;

    /// Runs every query in one round trip. The map has one entry per
    /// distinct query string; a repeated query keeps its last result.
    async fn multi_search(&self, queries: &[String]) -> IndexResult<HashMap<String, Vec<Pmid>>>;

    /// Upserts each document by id.
    async fn post(&self, abstracts: &[Abstract]) -> IndexResult<()>;

    /// Removes the listed documents, or drops the whole collection.
    async fn delete(&self, target: &DeleteTarget) -> IndexResult<()>;

    /// Every document id in the collection, without bodies.
    async fn get_all_identifiers(&self) -> IndexResult<Vec<Pmid>>;

    /// Merges a citation count into each listed document, in ascending id
    /// order. Stops at the first id that is not indexed with `NotFound`;
    /// entries before it remain applied.
    async fn add_citation_counts(&self, counts: &BTreeMap<Pmid, u64>) -> IndexResult<()>;
}

/// Connection settings for the search backend.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Base URL of the Elasticsearch node.
    pub url: String,
    /// Name of the abstracts index.
    pub index_name: String,
    /// Number of hits returned per query.
    pub search_size: usize,
    /// Page size when listing every id.
    pub page_size: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Ask the backend to make writes searchable before returning.
    pub refresh_on_write: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index_name: DEFAULT_INDEX.to_string(),
            search_size: 10,
            page_size: 1000,
            request_timeout: Duration::from_secs(30),
            refresh_on_write: false,
        }
    }
}

impl IndexConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = name.into();
        self
    }

    pub fn with_search_size(mut self, size: usize) -> Self {
        self.search_size = size;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_refresh_on_write(mut self, refresh: bool) -> Self {
        self.refresh_on_write = refresh;
        self
    }
}
