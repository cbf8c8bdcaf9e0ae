//! Integration tests for the Elasticsearch index client.
//!
//! The mocked tests check the requests sent for each operation and how
//! backend answers are mapped. The `#[ignore]` tests need a live node:
//! Run with: ELASTICSEARCH_URL=http://localhost:9200 cargo test --test elastic_index -- --ignored

use std::collections::BTreeMap;

use abstract_pool::index::{
    Abstract, DeleteTarget, DocumentIndex, ElasticIndex, IndexConfig, Pmid,
};
use abstract_pool::IndexError;
use mockito::Matcher;
use serde_json::json;

const INDEX: &str = "abstracts_test";

fn client(url: &str) -> ElasticIndex {
    ElasticIndex::new(IndexConfig::new(url).with_index_name(INDEX)).expect("client should build")
}

fn path(suffix: &str) -> String {
    if suffix.is_empty() {
        format!("/{}", INDEX)
    } else {
        format!("/{}/{}", INDEX, suffix)
    }
}

fn es_error(kind: &str, status: u16) -> String {
    json!({
        "error": {
            "root_cause": [{ "type": kind, "reason": "test" }],
            "type": kind,
            "reason": "test",
        },
        "status": status,
    })
    .to_string()
}

fn hits(ids: &[&str]) -> String {
    let hits: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| json!({ "_index": INDEX, "_id": id, "_score": 1.0, "sort": [i] }))
        .collect();
    json!({ "hits": { "total": { "value": ids.len() }, "hits": hits } }).to_string()
}

#[tokio::test]
async fn test_ensure_index_creates_missing_index() {
    let mut server = mockito::Server::new_async().await;
    let head = server
        .mock("HEAD", path("").as_str())
        .with_status(404)
        .create_async()
        .await;
    let create = server
        .mock("PUT", path("").as_str())
        .match_body(Matcher::PartialJson(json!({
            "mappings": { "properties": {
                "title": { "type": "text" },
                "text": { "type": "text" },
            }}
        })))
        .with_status(200)
        .with_body(r#"{"acknowledged":true}"#)
        .create_async()
        .await;

    let created = client(&server.url()).ensure_index().await.expect("ensure");

    assert!(created);
    head.assert_async().await;
    create.assert_async().await;
}

#[tokio::test]
async fn test_ensure_index_is_idempotent() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("HEAD", path("").as_str())
        .with_status(200)
        .create_async()
        .await;
    let create = server
        .mock("PUT", path("").as_str())
        .expect(0)
        .create_async()
        .await;

    let index = client(&server.url());
    assert!(!index.ensure_index().await.expect("first"));
    assert!(!index.ensure_index().await.expect("second"));
    create.assert_async().await;
}

#[tokio::test]
async fn test_ensure_index_tolerates_creation_race() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("HEAD", path("").as_str())
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("PUT", path("").as_str())
        .with_status(400)
        .with_body(es_error("resource_already_exists_exception", 400))
        .create_async()
        .await;

    let created = client(&server.url()).ensure_index().await.expect("ensure");
    assert!(!created);
}

#[tokio::test]
async fn test_get_returns_source_or_not_found() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", path("_doc/7").as_str())
        .with_status(200)
        .with_body(
            json!({
                "_index": INDEX,
                "_id": "7",
                "found": true,
                "_source": { "pmid": 7, "title": "Sepsis", "text": "Outcomes", "citation_count": 3 }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", path("_doc/8").as_str())
        .with_status(404)
        .with_body(json!({ "_index": INDEX, "_id": "8", "found": false }).to_string())
        .create_async()
        .await;

    let index = client(&server.url());
    let doc = index.get(Pmid(7)).await.expect("document");
    assert_eq!(doc.title, "Sepsis");
    assert_eq!(doc.citation_count, Some(3));

    let err = index.get(Pmid(8)).await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound(Pmid(8))));
}

#[tokio::test]
async fn test_search_keeps_backend_order() {
    let mut server = mockito::Server::new_async().await;
    let search = server
        .mock("POST", path("_search").as_str())
        .match_body(Matcher::PartialJson(json!({
            "size": 10,
            "_source": false,
            "query": { "multi_match": {
                "query": "septic shock",
                "fields": ["title", "text"],
                "operator": "or",
            }}
        })))
        .with_status(200)
        .with_body(hits(&["31", "4", "15"]))
        .create_async()
        .await;

    let found = client(&server.url())
        .search("septic shock")
        .await
        .expect("search");

    assert_eq!(found, vec![Pmid(31), Pmid(4), Pmid(15)]);
    search.assert_async().await;
}

#[tokio::test]
async fn test_search_on_missing_index_is_empty() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", path("_search").as_str())
        .with_status(404)
        .with_body(es_error("index_not_found_exception", 404))
        .create_async()
        .await;

    let index = client(&server.url());
    assert!(index.search("anything").await.expect("search").is_empty());
    assert!(index.get_all_identifiers().await.expect("ids").is_empty());
}

#[tokio::test]
async fn test_backend_failure_is_reported() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", path("_search").as_str())
        .with_status(503)
        .with_body(es_error("cluster_block_exception", 503))
        .create_async()
        .await;

    let err = client(&server.url()).search("x").await.unwrap_err();
    match err {
        IndexError::Backend { status, message } => {
            assert_eq!(status, 503);
            assert!(message.contains("cluster_block_exception"));
        }
        other => panic!("expected backend error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_connection_error() {
    let index = client("http://127.0.0.1:1");
    let err = index.search("x").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_multi_search_single_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let msearch = server
        .mock("POST", path("_msearch").as_str())
        .match_header("content-type", "application/x-ndjson")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""query":"aging""#.to_string()),
            Matcher::Regex(r#""query":"metformin""#.to_string()),
        ]))
        .with_status(200)
        .with_body(
            json!({
                "responses": [
                    { "hits": { "hits": [{ "_id": "2" }, { "_id": "1" }] }, "status": 200 },
                    { "hits": { "hits": [] }, "status": 200 },
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let queries = vec!["aging".to_string(), "metformin".to_string()];
    let results = client(&server.url())
        .multi_search(&queries)
        .await
        .expect("multi search");

    assert_eq!(results.len(), 2);
    assert_eq!(results["aging"], vec![Pmid(2), Pmid(1)]);
    assert!(results["metformin"].is_empty());
    msearch.assert_async().await;
}

#[tokio::test]
async fn test_multi_search_duplicate_queries_collapse() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", path("_msearch").as_str())
        .with_status(200)
        .with_body(
            json!({
                "responses": [
                    { "hits": { "hits": [{ "_id": "5" }] } },
                    { "hits": { "hits": [{ "_id": "5" }] } },
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let queries = vec!["tp53".to_string(), "tp53".to_string()];
    let results = client(&server.url())
        .multi_search(&queries)
        .await
        .expect("multi search");

    assert_eq!(results.len(), 1);
    assert_eq!(results["tp53"], vec![Pmid(5)]);
}

#[tokio::test]
async fn test_multi_search_empty_input_sends_nothing() {
    let mut server = mockito::Server::new_async().await;
    let msearch = server
        .mock("POST", path("_msearch").as_str())
        .expect(0)
        .create_async()
        .await;

    let results = client(&server.url())
        .multi_search(&[])
        .await
        .expect("multi search");

    assert!(results.is_empty());
    msearch.assert_async().await;
}

#[tokio::test]
async fn test_post_upserts_each_document() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("PUT", path("_doc/1").as_str())
        .match_body(Matcher::PartialJson(json!({ "pmid": 1, "title": "First" })))
        .with_status(201)
        .create_async()
        .await;
    let second = server
        .mock("PUT", path("_doc/2").as_str())
        .match_body(Matcher::PartialJson(json!({ "pmid": 2, "pub_year": 2019 })))
        .with_status(200)
        .create_async()
        .await;

    let docs = vec![
        Abstract::new(1u64, "First", "One"),
        Abstract::new(2u64, "Second", "Two").with_pub_year(2019),
    ];
    client(&server.url()).post(&docs).await.expect("post");

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_refresh_on_write_adds_query_param() {
    let mut server = mockito::Server::new_async().await;
    let put = server
        .mock("PUT", Matcher::Regex(format!("^{}", path("_doc/9"))))
        .match_query(Matcher::UrlEncoded(
            "refresh".to_string(),
            "wait_for".to_string(),
        ))
        .with_status(201)
        .create_async()
        .await;

    let index = ElasticIndex::new(
        IndexConfig::new(server.url())
            .with_index_name(INDEX)
            .with_refresh_on_write(true),
    )
    .expect("client");
    index
        .post(&[Abstract::new(9u64, "Nine", "")])
        .await
        .expect("post");

    put.assert_async().await;
}

#[tokio::test]
async fn test_delete_all_ignores_missing_index() {
    let mut server = mockito::Server::new_async().await;
    let drop_index = server
        .mock("DELETE", path("").as_str())
        .with_status(404)
        .with_body(es_error("index_not_found_exception", 404))
        .create_async()
        .await;
    let recreate = server
        .mock("PUT", path("").as_str())
        .expect(0)
        .create_async()
        .await;

    client(&server.url())
        .delete(&DeleteTarget::All)
        .await
        .expect("delete all");

    drop_index.assert_async().await;
    recreate.assert_async().await;
}

#[tokio::test]
async fn test_delete_ids_treats_missing_as_done() {
    let mut server = mockito::Server::new_async().await;
    let present = server
        .mock("DELETE", path("_doc/10").as_str())
        .with_status(200)
        .create_async()
        .await;
    let absent = server
        .mock("DELETE", path("_doc/11").as_str())
        .with_status(404)
        .with_body(json!({ "result": "not_found" }).to_string())
        .create_async()
        .await;

    client(&server.url())
        .delete(&DeleteTarget::Ids(vec![Pmid(10), Pmid(11)]))
        .await
        .expect("delete ids");

    present.assert_async().await;
    absent.assert_async().await;
}

#[tokio::test]
async fn test_citation_counts_stop_at_first_missing_id() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("POST", path("_update/1").as_str())
        .match_body(Matcher::Json(json!({ "doc": { "citation_count": 12 } })))
        .with_status(200)
        .create_async()
        .await;
    let missing = server
        .mock("POST", path("_update/2").as_str())
        .with_status(404)
        .with_body(es_error("document_missing_exception", 404))
        .create_async()
        .await;
    let never = server
        .mock("POST", path("_update/3").as_str())
        .expect(0)
        .create_async()
        .await;

    let counts: BTreeMap<Pmid, u64> = [(Pmid(3), 1), (Pmid(1), 12), (Pmid(2), 5)]
        .into_iter()
        .collect();
    let err = client(&server.url())
        .add_citation_counts(&counts)
        .await
        .unwrap_err();

    assert!(matches!(err, IndexError::NotFound(Pmid(2))));
    first.assert_async().await;
    missing.assert_async().await;
    never.assert_async().await;
}

#[tokio::test]
async fn test_get_all_identifiers_pages_with_search_after() {
    let mut server = mockito::Server::new_async().await;
    let first_page = server
        .mock("POST", path("_search").as_str())
        .match_body(Matcher::PartialJson(json!({
            "size": 2,
            "_source": false,
            "sort": ["_doc"],
        })))
        .with_status(200)
        .with_body(hits(&["100", "101"]))
        .expect(1)
        .create_async()
        .await;
    let second_page = server
        .mock("POST", path("_search").as_str())
        .match_body(Matcher::PartialJson(json!({ "search_after": [1] })))
        .with_status(200)
        .with_body(hits(&["102"]))
        .expect(1)
        .create_async()
        .await;

    let index = ElasticIndex::new(
        IndexConfig::new(server.url())
            .with_index_name(INDEX)
            .with_page_size(2),
    )
    .expect("client");
    let ids = index.get_all_identifiers().await.expect("ids");

    assert_eq!(ids, vec![Pmid(100), Pmid(101), Pmid(102)]);
    first_page.assert_async().await;
    second_page.assert_async().await;
}

// ============================================================================
// Live backend
// ============================================================================

async fn live_index(name: &str) -> ElasticIndex {
    let url = std::env::var("ELASTICSEARCH_URL")
        .expect("ELASTICSEARCH_URL environment variable must be set for live tests");
    let index = ElasticIndex::new(
        IndexConfig::new(url)
            .with_index_name(name)
            .with_refresh_on_write(true),
    )
    .expect("client");
    index
        .delete(&DeleteTarget::All)
        .await
        .expect("reset index");
    index
}

#[tokio::test]
#[ignore] // Run with: cargo test --test elastic_index -- --ignored
async fn test_live_index_creation_is_idempotent() {
    let index = live_index("abstract_pool_live_create").await;

    assert!(index.ensure_index().await.expect("create"));
    assert!(!index.ensure_index().await.expect("exists"));

    index.delete(&DeleteTarget::All).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_live_upsert_search_and_citations() {
    let index = live_index("abstract_pool_live_roundtrip").await;
    index.ensure_index().await.expect("create");

    let doc = Abstract::new(5001u64, "Vitamin D and fracture risk", "A randomized trial.");
    index.post(&[doc.clone()]).await.expect("post");
    assert_eq!(index.get(Pmid(5001)).await.expect("get"), doc);

    let hits = index.search("fracture").await.expect("search");
    assert!(hits.contains(&Pmid(5001)));

    let queries = vec!["vitamin".to_string(), "randomized".to_string()];
    let results = index.multi_search(&queries).await.expect("multi search");
    for query in &queries {
        assert_eq!(results[query], index.search(query).await.expect("search"));
    }

    let counts: BTreeMap<Pmid, u64> = [(Pmid(5001), 42)].into_iter().collect();
    index.add_citation_counts(&counts).await.expect("citations");
    let updated = index.get(Pmid(5001)).await.expect("get");
    assert_eq!(updated.citation_count, Some(42));
    assert_eq!(updated.title, doc.title);

    assert_eq!(
        index.get_all_identifiers().await.expect("ids"),
        vec![Pmid(5001)]
    );

    index.delete(&DeleteTarget::All).await.expect("delete all");
    assert!(index.get_all_identifiers().await.expect("ids").is_empty());
}
