//! Elasticsearch backend for the abstracts index.
//!
//! Talks to the REST API directly with `reqwest`. Every call is a fresh
//! request; the only state kept is the pooled HTTP client and the config.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use super::document::{Abstract, DeleteTarget, Pmid};
use super::query::{
    self, BackendError, GetResponse, MultiSearchResponse, SearchResponse, ALREADY_EXISTS,
    INDEX_NOT_FOUND,
};
use super::{DocumentIndex, IndexConfig};
use crate::error::{IndexError, IndexResult};
use crate::metrics::MetricsCollector;

/// Document index backed by an Elasticsearch node.
#[derive(Debug, Clone)]
pub struct ElasticIndex {
    http_client: Client,
    config: IndexConfig,
    metrics: MetricsCollector,
}

impl ElasticIndex {
    /// Builds a client without touching the network.
    pub fn new(config: IndexConfig) -> IndexResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexError::Connection(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
            metrics: MetricsCollector::new(),
        })
    }

    /// Builds a client and creates the index if it does not exist yet.
    pub async fn connect(config: IndexConfig) -> IndexResult<Self> {
        let index = Self::new(config)?;
        index.ensure_index().await?;
        Ok(index)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    /// Creates the index if it is missing. Returns `true` when this call
    /// created it. Losing a creation race to another worker is not an error.
    pub async fn ensure_index(&self) -> IndexResult<bool> {
        let response = self
            .send("exists", self.http_client.head(self.index_url()))
            .await?;
        if response.status().is_success() {
            return Ok(false);
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(Self::error_from(response).await);
        }

        let mappings = json!({
            "mappings": {
                "properties": {
                    "pmid": { "type": "long" },
                    "title": { "type": "text" },
                    "text": { "type": "text" },
                    "pub_year": { "type": "integer" },
                    "origin": { "type": "keyword" },
                    "citation_count": { "type": "long" },
                }
            }
        });
        let response = self
            .send(
                "create_index",
                self.http_client.put(self.index_url()).json(&mappings),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(index = %self.config.index_name, "Created abstracts index");
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        let err = BackendError::parse(&body);
        if status == StatusCode::BAD_REQUEST && (err.is(ALREADY_EXISTS) || err.kind.is_none()) {
            debug!(index = %self.config.index_name, "Index already exists");
            return Ok(false);
        }
        Err(err.into_index_error(status.as_u16()))
    }

    fn index_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.index_name
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.index_url(), path)
    }

    fn write_url(&self, path: &str) -> String {
        if self.config.refresh_on_write {
            format!("{}?refresh=wait_for", self.endpoint(path))
        } else {
            self.endpoint(path)
        }
    }

    /// Sends a request, mapping transport failures to `Connection` and
    /// recording latency per operation.
    async fn send(&self, operation: &str, request: RequestBuilder) -> IndexResult<Response> {
        let start = Instant::now();
        let result = request.send().await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let ok =
                    response.status().is_success() || response.status() == StatusCode::NOT_FOUND;
                self.metrics.record_index_request(operation, ok, elapsed);
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_index_request(operation, false, elapsed);
                Err(IndexError::Connection(e.to_string()))
            }
        }
    }

    async fn error_from(response: Response) -> IndexError {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        BackendError::parse(&body).into_index_error(status)
    }

    /// Splits a failed response into its status and parsed error body.
    async fn backend_error(response: Response) -> (StatusCode, BackendError) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        (status, BackendError::parse(&body))
    }
}

#[async_trait]
impl DocumentIndex for ElasticIndex {
    async fn get(&self, pmid: Pmid) -> IndexResult<Abstract> {
        let url = self.endpoint(&format!("_doc/{}", pmid));
        let response = self.send("get", self.http_client.get(url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(pmid));
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: GetResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        match body.source {
            Some(source) if body.found => Ok(source),
            _ => Err(IndexError::NotFound(pmid)),
        }
    }

    async fn search(&self, query: &str) -> IndexResult<Vec<Pmid>> {
        let body = query::multi_match(query, self.config.search_size);
        let response = self
            .send(
                "search",
                self.http_client.post(self.endpoint("_search")).json(&body),
            )
            .await?;

        if !response.status().is_success() {
            let (status, err) = Self::backend_error(response).await;
            if status == StatusCode::NOT_FOUND && err.is(INDEX_NOT_FOUND) {
                return Ok(Vec::new());
            }
            return Err(err.into_index_error(status.as_u16()));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        parsed.hits.pmids()
    }

    async fn multi_search(&self, queries: &[String]) -> IndexResult<HashMap<String, Vec<Pmid>>> {
        if queries.is_empty() {
            return Ok(HashMap::new());
        }

        let body = query::multi_search_body(queries, self.config.search_size)?;
        let response = self
            .send(
                "multi_search",
                self.http_client
                    .post(self.endpoint("_msearch"))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;

        if !response.status().is_success() {
            let (status, err) = Self::backend_error(response).await;
            if status == StatusCode::NOT_FOUND && err.is(INDEX_NOT_FOUND) {
                return Ok(queries.iter().map(|q| (q.clone(), Vec::new())).collect());
            }
            return Err(err.into_index_error(status.as_u16()));
        }

        let parsed: MultiSearchResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        if parsed.responses.len() != queries.len() {
            return Err(IndexError::Parse(format!(
                "expected {} search responses, got {}",
                queries.len(),
                parsed.responses.len()
            )));
        }

        let mut results = HashMap::with_capacity(queries.len());
        for (query, item) in queries.iter().zip(parsed.responses) {
            let pmids = match (item.hits, item.error) {
                (_, Some(error)) => {
                    let err = BackendError::from_value(&error).unwrap_or_default();
                    if err.is(INDEX_NOT_FOUND) {
                        Vec::new()
                    } else {
                        return Err(err.into_index_error(item.status.unwrap_or(500)));
                    }
                }
                (Some(hits), None) => hits.pmids()?,
                (None, None) => Vec::new(),
            };
            results.insert(query.clone(), pmids);
        }
        Ok(results)
    }

    async fn post(&self, abstracts: &[Abstract]) -> IndexResult<()> {
        for doc in abstracts {
            let url = self.write_url(&format!("_doc/{}", doc.pmid));
            let response = self.send("post", self.http_client.put(url).json(doc)).await?;
            if !response.status().is_success() {
                return Err(Self::error_from(response).await);
            }
        }
        debug!(count = abstracts.len(), "Posted abstracts");
        Ok(())
    }

    async fn delete(&self, target: &DeleteTarget) -> IndexResult<()> {
        match target {
            DeleteTarget::All => {
                let response = self
                    .send("delete_index", self.http_client.delete(self.index_url()))
                    .await?;
                let status = response.status();
                if status.is_success()
                    || status == StatusCode::NOT_FOUND
                    || status == StatusCode::BAD_REQUEST
                {
                    warn!(index = %self.config.index_name, "Deleted entire abstracts index");
                    return Ok(());
                }
                Err(Self::error_from(response).await)
            }
            DeleteTarget::Ids(pmids) => {
                for pmid in pmids {
                    let url = self.write_url(&format!("_doc/{}", pmid));
                    let response = self.send("delete", self.http_client.delete(url)).await?;
                    if response.status() == StatusCode::NOT_FOUND {
                        debug!(pmid = %pmid, "Abstract already absent");
                        continue;
                    }
                    if !response.status().is_success() {
                        return Err(Self::error_from(response).await);
                    }
                }
                Ok(())
            }
        }
    }

    async fn get_all_identifiers(&self) -> IndexResult<Vec<Pmid>> {
        let page_size = self.config.page_size;
        let mut pmids = Vec::new();
        let mut cursor = None;

        loop {
            let body = query::id_projection_page(page_size, cursor.as_ref());
            let response = self
                .send(
                    "list_ids",
                    self.http_client.post(self.endpoint("_search")).json(&body),
                )
                .await?;

            if !response.status().is_success() {
                let (status, err) = Self::backend_error(response).await;
                if status == StatusCode::NOT_FOUND && err.is(INDEX_NOT_FOUND) {
                    return Ok(Vec::new());
                }
                return Err(err.into_index_error(status.as_u16()));
            }

            let page: SearchResponse = response
                .json()
                .await
                .map_err(|e| IndexError::Parse(e.to_string()))?;
            pmids.extend(page.hits.pmids()?);

            if page.hits.hits.len() < page_size {
                break;
            }
            cursor = match page.hits.hits.last().and_then(|hit| hit.sort.clone()) {
                Some(sort) => Some(sort),
                None => {
                    return Err(IndexError::Parse(
                        "paged listing returned hits without sort values".to_string(),
                    ))
                }
            };
        }

        Ok(pmids)
    }

    async fn add_citation_counts(&self, counts: &BTreeMap<Pmid, u64>) -> IndexResult<()> {
        for (pmid, count) in counts {
            let url = self.write_url(&format!("_update/{}", pmid));
            let response = self
                .send(
                    "update",
                    self.http_client.post(url).json(&query::citation_update(*count)),
                )
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                warn!(pmid = %pmid, "Cannot add citation count to missing abstract");
                return Err(IndexError::NotFound(*pmid));
            }
            if !response.status().is_success() {
                return Err(Self::error_from(response).await);
            }
        }
        Ok(())
    }
}
