//! End-to-end tests against mocked Gmail, arXiv, and OpenSearch endpoints.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ingest_harness::config::{ConnectorConfig, UnstructuredOptions};
use ingest_harness::connector::{Connector, ConnectorFactory};
use ingest_harness::extractor::{create_extractor, ExtractBatch, ExtractContext, ExtractFilter};
use ingest_harness::index::SearchIndex;
use ingest_harness::loader::BulkIngestor;
use ingest_harness::models::NormalizedDocument;
use ingest_harness::resilience::{Backoff, Resilience, RetryPolicy};
use ingest_harness::transform::{transform_batch, UnstructuredTransformer};

fn quick_retry(max_attempts: u32) -> Resilience {
    Resilience::new(
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        },
        None,
    )
}

fn connector(source_type: &str, params: Value) -> Connector {
    let table: toml::Table = toml::Value::try_from(params)
        .unwrap()
        .try_into()
        .unwrap();
    ConnectorFactory::with_builtins()
        .create(&ConnectorConfig::new(source_type, table), None)
        .unwrap()
}

fn b64(s: &str) -> String {
    URL_SAFE_NO_PAD.encode(s.as_bytes())
}

async fn collect(
    connector: &Connector,
    extract: Value,
    label: &str,
    resilience: Resilience,
) -> Vec<ExtractBatch> {
    let options: toml::Table = toml::Value::try_from(extract)
        .unwrap()
        .try_into()
        .unwrap();
    let extractor = create_extractor(
        connector,
        &options,
        ExtractContext {
            source_label: label.to_string(),
            resilience,
            concurrency: 2,
        },
    )
    .unwrap();
    let filter = ExtractFilter::default();
    let batches: Vec<_> = extractor.extract(&filter).collect().await;
    batches.into_iter().map(|b| b.unwrap()).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Gmail
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gmail_extracts_messages_with_inlined_attachments() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .and(query_param("q", "label:papers"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{ "id": "m1" }, { "id": "m2" }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "see attached",
            "internalDate": "1704067200000",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "Subject", "value": "Weekly papers" },
                    { "name": "From", "value": "alice@example.com" },
                    { "name": "X-Mailer", "value": "ignored" }
                ],
                "parts": [
                    {
                        "partId": "0",
                        "mimeType": "text/plain",
                        "body": { "size": 11, "data": b64("Hello team.") }
                    },
                    {
                        "partId": "1",
                        "mimeType": "text/plain",
                        "filename": "notes.txt",
                        "body": { "size": 14, "attachmentId": "a1" }
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m1/attachments/a1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": b64("Attached notes") })),
        )
        .mount(&server)
        .await;

    // m2 keeps failing server-side and ends up as a per-item failure.
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m2"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let gmail = connector(
        "gmail",
        json!({
            "refresh_token": "r",
            "client_id": "c",
            "client_secret": "s",
            "token_uri": format!("{}/token", server.uri()),
            "api_base": format!("{}/gmail/v1", server.uri()),
        }),
    );
    let batches = collect(
        &gmail,
        json!({ "query": "label:papers" }),
        "gmail:inbox",
        quick_retry(2),
    )
    .await;

    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].id, "m2");

    let record = &batch.records[0];
    assert_eq!(record.source, "gmail:inbox");
    assert_eq!(record.metadata["subject"], "Weekly papers");
    assert_eq!(record.metadata["from"], "alice@example.com");
    assert_eq!(record.metadata["thread_id"], "t1");
    assert!(record.metadata.get("x-mailer").is_none());

    let outcome = transform_batch(
        &UnstructuredTransformer::new(UnstructuredOptions::default()),
        &batch.records,
    );
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.documents.len(), 2);
    let parent = &outcome.documents[0];
    let attachment = &outcome.documents[1];
    assert_eq!(parent.text.as_deref(), Some("Hello team."));
    assert_eq!(attachment.text.as_deref(), Some("Attached notes"));
    assert_eq!(attachment.metadata["parent_id"], Value::String(parent.id.clone()));
    assert_eq!(attachment.metadata["attachment_name"], "notes.txt");
}

// ═══════════════════════════════════════════════════════════════════════
// arXiv
// ═══════════════════════════════════════════════════════════════════════

fn feed(base: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/abs/2401.00001v1</id>
    <published>2024-01-01T00:00:00Z</published>
    <title>Broken Download</title>
    <summary>The PDF is gone.</summary>
    <author><name>Ada Lovelace</name></author>
    <link title="pdf" href="{base}/pdf/2401.00001v1" rel="related" type="application/pdf"/>
    <category term="cs.AI"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2401.00002v1</id>
    <published>2024-01-02T00:00:00Z</published>
    <title>No Link</title>
    <summary>Abstract only.</summary>
  </entry>
</feed>"#
    )
}

#[tokio::test]
async fn arxiv_failed_pdf_keeps_record_with_text_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/query"))
        .and(query_param("search_query", "cat:cs.AI"))
        .and(query_param("sortBy", "submittedDate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(feed(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdf/2401.00001v1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let arxiv = connector(
        "arxiv",
        json!({ "base_url": format!("{}/api/query", server.uri()) }),
    );
    let batches = collect(
        &arxiv,
        json!({ "search_category": "cs.AI", "page_size": 10, "max_results": 10 }),
        "arxiv:cs.AI",
        quick_retry(3),
    )
    .await;

    assert_eq!(batches.len(), 1);
    let records = &batches[0].records;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "2401.00001v1");
    assert!(records[0].metadata.contains_key("pdf_error"));
    assert_eq!(records[0].metadata["authors"], json!(["Ada Lovelace"]));
    assert!(records[1].metadata.contains_key("pdf_error"));

    let outcome = transform_batch(
        &UnstructuredTransformer::new(UnstructuredOptions::default()),
        records,
    );
    assert_eq!(outcome.documents.len(), 2);
    assert_eq!(
        outcome.documents[0].text.as_deref(),
        Some("Broken Download\n\nThe PDF is gone.")
    );
}

// ═══════════════════════════════════════════════════════════════════════
// OpenSearch sink
// ═══════════════════════════════════════════════════════════════════════

fn search_sink(server: &MockServer) -> ingest_harness::connector_search::SearchIndexConnector {
    let addr = server.address();
    match connector(
        "opensearch",
        json!({ "host": addr.ip().to_string(), "port": addr.port() }),
    ) {
        Connector::SearchIndex(c) => c,
        other => panic!("unexpected connector {:?}", other),
    }
}

fn docs(n: usize) -> Vec<NormalizedDocument> {
    (0..n)
        .map(|i| {
            NormalizedDocument::new(
                &format!("test:{}", i),
                "test",
                &i.to_string(),
                Some(format!("document {}", i)),
            )
        })
        .collect()
}

#[tokio::test]
async fn bulk_reports_exactly_the_rejected_documents() {
    let server = MockServer::start().await;
    let docs = docs(10);
    let rejected = [docs[3].id.clone(), docs[7].id.clone()];

    let items: Vec<Value> = docs
        .iter()
        .map(|d| {
            if rejected.contains(&d.id) {
                json!({ "index": { "_id": d.id, "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse field [text]"
                }}})
            } else {
                json!({ "index": { "_id": d.id, "status": 201 } })
            }
        })
        .collect();
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(header("content-type", "application/x-ndjson"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "errors": true, "items": items })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let sink = search_sink(&server);
    let ingestor = BulkIngestor::new(
        std::sync::Arc::new(sink),
        "docs",
        Resilience::passthrough(),
        None,
    );
    let report = ingestor
        .ingest_batch(docs, &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded.len(), 8);
    let mut failed = report.failed_ids();
    failed.sort();
    let mut expected: Vec<&str> = rejected.iter().map(String::as_str).collect();
    expected.sort();
    assert_eq!(failed, expected);
    assert!(report.failed[0].reason.contains("mapper_parsing_exception"));
    assert!(report.not_submitted.is_empty());
}

#[tokio::test]
async fn ensure_index_creates_missing_index_once() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/papers"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/papers"))
        .and(body_string_contains("knn_vector"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;

    let sink = search_sink(&server);
    sink.ensure_index("papers", Some(8)).await.unwrap();
}

#[tokio::test]
async fn ensure_index_tolerates_creation_race() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/papers"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/papers"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "resource_already_exists_exception", "reason": "index [papers] already exists" },
            "status": 400
        })))
        .mount(&server)
        .await;

    let sink = search_sink(&server);
    sink.ensure_index("papers", None).await.unwrap();
}

#[tokio::test]
async fn upsert_uses_document_id_path() {
    let server = MockServer::start().await;
    let doc = docs(1).remove(0);
    Mock::given(method("PUT"))
        .and(path(format!("/items/_doc/{}", doc.id)))
        .and(body_string_contains("document 0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "updated" })))
        .expect(2)
        .mount(&server)
        .await;

    let sink = search_sink(&server);
    sink.upsert("items", &doc).await.unwrap();
    sink.upsert("items", &doc).await.unwrap();
}

#[tokio::test]
async fn sink_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/_count"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/_count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 42 })))
        .mount(&server)
        .await;

    let sink = search_sink(&server);
    let count = quick_retry(3)
        .call("count", || sink.count("items"))
        .await
        .unwrap();
    assert_eq!(count, 42);
}
