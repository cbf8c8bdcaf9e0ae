//! In-process document index.
//!
//! Mirrors the Elasticsearch backend's observable behaviour closely enough
//! for inline debugging runs and tests: upsert by id, OR-term matching over
//! title and text, a droppable collection, partial citation updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::document::{Abstract, DeleteTarget, Pmid};
use super::DocumentIndex;
use crate::error::{IndexError, IndexResult};

/// Default number of hits per query, matching the Elasticsearch default.
const DEFAULT_SEARCH_SIZE: usize = 10;

/// Document index held in memory. `None` means the collection was dropped.
#[derive(Debug)]
pub struct MemoryIndex {
    documents: RwLock<Option<BTreeMap<Pmid, Abstract>>>,
    search_size: usize,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Some(BTreeMap::new())),
            search_size: DEFAULT_SEARCH_SIZE,
        }
    }

    pub fn with_search_size(mut self, size: usize) -> Self {
        self.search_size = size;
        self
    }

    /// Creates the collection if it was dropped. Returns `true` when created.
    pub fn ensure_index(&self) -> bool {
        let mut documents = self.write();
        if documents.is_none() {
            *documents = Some(BTreeMap::new());
            return true;
        }
        false
    }

    /// Whether the collection currently exists.
    pub fn exists(&self) -> bool {
        self.read().is_some()
    }

    pub fn len(&self) -> usize {
        self.read().as_ref().map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<BTreeMap<Pmid, Abstract>>> {
        self.documents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<BTreeMap<Pmid, Abstract>>> {
        self.documents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn run_query(&self, query: &str) -> Vec<Pmid> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let documents = self.read();
        let Some(documents) = documents.as_ref() else {
            return Vec::new();
        };

        let mut scored: Vec<(usize, Pmid)> = documents
            .values()
            .filter_map(|doc| {
                let score = field_score(&doc.title, &terms).max(field_score(&doc.text, &terms));
                (score > 0).then_some((score, doc.pmid))
            })
            .collect();

        // Highest score first, ties broken by id for stable output.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(self.search_size)
            .map(|(_, pmid)| pmid)
            .collect()
    }
}

/// Lowercased alphanumeric terms.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Occurrences of any query term in a field.
fn field_score(field: &str, terms: &[String]) -> usize {
    tokenize(field)
        .iter()
        .filter(|token| terms.contains(token))
        .count()
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn get(&self, pmid: Pmid) -> IndexResult<Abstract> {
        self.read()
            .as_ref()
            .and_then(|docs| docs.get(&pmid).cloned())
            .ok_or(IndexError::NotFound(pmid))
    }

    async fn search(&self, query: &str) -> IndexResult<Vec<Pmid>> {
        Ok(self.run_query(query))
    }

    async fn multi_search(&self, queries: &[String]) -> IndexResult<HashMap<String, Vec<Pmid>>> {
        let mut results = HashMap::with_capacity(queries.len());
        for query in queries {
            results.insert(query.clone(), self.run_query(query));
        }
        Ok(results)
    }

    async fn post(&self, abstracts: &[Abstract]) -> IndexResult<()> {
        let mut documents = self.write();
        // Writing to a dropped collection recreates it, as the backend does.
        let documents = documents.get_or_insert_with(BTreeMap::new);
        for doc in abstracts {
            documents.insert(doc.pmid, doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, target: &DeleteTarget) -> IndexResult<()> {
        let mut documents = self.write();
        match target {
            DeleteTarget::All => {
                *documents = None;
            }
            DeleteTarget::Ids(pmids) => {
                if let Some(documents) = documents.as_mut() {
                    for pmid in pmids {
                        documents.remove(pmid);
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_all_identifiers(&self) -> IndexResult<Vec<Pmid>> {
        Ok(self
            .read()
            .as_ref()
            .map(|docs| docs.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn add_citation_counts(&self, counts: &BTreeMap<Pmid, u64>) -> IndexResult<()> {
        let mut documents = self.write();
        for (pmid, count) in counts {
            let doc = documents
                .as_mut()
                .and_then(|docs| docs.get_mut(pmid))
                .ok_or(IndexError::NotFound(*pmid))?;
            doc.citation_count = Some(*count);
        }
        Ok(())
    }
}
