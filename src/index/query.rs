//! Request bodies and response shapes for the Elasticsearch REST API.

use serde::Deserialize;
use serde_json::{json, Value};

use super::document::{Abstract, Pmid};
use crate::error::{IndexError, IndexResult};

/// Fields free-text queries are matched against.
pub const SEARCH_FIELDS: [&str; 2] = ["title", "text"];

/// Error type returned when creating an index that already exists.
pub const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// Error type returned when addressing an index that does not exist.
pub const INDEX_NOT_FOUND: &str = "index_not_found_exception";

/// OR-combined multi-field match over title and text, ids only.
pub fn multi_match(query: &str, size: usize) -> Value {
    json!({
        "size": size,
        "_source": false,
        "query": {
            "multi_match": {
                "query": query,
                "fields": SEARCH_FIELDS,
                "operator": "or",
            }
        }
    })
}

/// Newline-delimited `_msearch` body. The index comes from the request path,
/// so every header line is empty.
pub fn multi_search_body(queries: &[String], size: usize) -> IndexResult<String> {
    let mut body = String::new();
    for query in queries {
        body.push_str("{}\n");
        body.push_str(&serde_json::to_string(&multi_match(query, size))?);
        body.push('\n');
    }
    Ok(body)
}

/// One page of a zero-field listing of every document, in index order.
pub fn id_projection_page(page_size: usize, search_after: Option<&Value>) -> Value {
    let mut body = json!({
        "size": page_size,
        "_source": false,
        "query": { "match_all": {} },
        "sort": ["_doc"],
    });
    if let Some(cursor) = search_after {
        body["search_after"] = cursor.clone();
    }
    body
}

/// Partial update that merges the citation count into an existing document.
pub fn citation_update(count: u64) -> Value {
    json!({ "doc": { "citation_count": count } })
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub hits: Hits,
}

#[derive(Debug, Default, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub hits: Vec<Hit>,
}

impl Hits {
    /// Hit ids in relevance order.
    pub fn pmids(&self) -> IndexResult<Vec<Pmid>> {
        self.hits.iter().map(|hit| hit.id.parse()).collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub sort: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct MultiSearchResponse {
    pub responses: Vec<MultiSearchItem>,
}

/// A single `_msearch` sub-response. Failed sub-searches carry `error`
/// instead of `hits`.
#[derive(Debug, Deserialize)]
pub struct MultiSearchItem {
    #[serde(default)]
    pub hits: Option<Hits>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct GetResponse {
    #[serde(default)]
    pub found: bool,
    #[serde(rename = "_source")]
    pub source: Option<Abstract>,
}

/// Type and reason of an Elasticsearch error body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendError {
    pub kind: Option<String>,
    pub reason: String,
}

impl BackendError {
    /// Extracts `error.type` and `error.reason` from a response body. Falls
    /// back to the raw text when the body is not the usual error document.
    pub fn parse(body: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            return Self {
                kind: None,
                reason: body.to_string(),
            };
        };
        match Self::from_value(&value) {
            Some(err) if err.kind.is_some() || !err.reason.is_empty() => err,
            _ => Self {
                kind: None,
                reason: body.to_string(),
            },
        }
    }

    /// Reads the `error` member of an error document or `_msearch` item.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.get("error").unwrap_or(value) {
            Value::String(reason) => Some(Self {
                kind: None,
                reason: reason.clone(),
            }),
            Value::Object(obj) => Some(Self {
                kind: obj.get("type").and_then(Value::as_str).map(str::to_string),
                reason: obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => None,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    pub fn into_index_error(self, status: u16) -> IndexError {
        let message = match self.kind {
            Some(kind) => format!("{}: {}", kind, self.reason),
            None => self.reason,
        };
        IndexError::Backend { status, message }
    }
}
