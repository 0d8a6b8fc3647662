//! End-to-end scenarios against a running ragnard instance.
//!
//! These tests need the full stack (Postgres with pgvector, an S3 bucket,
//! the embedding service, and a ragnard process) and are therefore ignored
//! by default. Point them at an instance with:
//!
//! ```text
//! RAGNAR_TEST_URI=http://127.0.0.1:8080 \
//! RAGNAR_TEST_TOKEN=rag_... \
//! cargo test --test live_validation -- --ignored
//! ```

use std::env;
use std::time::Duration;

fn base_uri() -> String {
    env::var("RAGNAR_TEST_URI").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
}

fn token() -> String {
    env::var("RAGNAR_TEST_TOKEN").expect("RAGNAR_TEST_TOKEN must hold an access key")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_tub(client: &reqwest::Client, name: &str) {
    let response = client
        .post(format!("{}/tubs", base_uri()))
        .bearer_auth(token())
        .json(&serde_json::json!({ "tub_name": name }))
        .send()
        .await
        .expect("create tub request");
    assert!(
        response.status().is_success(),
        "tub creation failed: {}",
        response.status()
    );
}

async fn delete_tub(client: &reqwest::Client, name: &str) {
    let _ = client
        .delete(format!("{}/tubs/{name}", base_uri()))
        .bearer_auth(token())
        .send()
        .await;
}

async fn poll_until_completed(client: &reqwest::Client, tub: &str, document_id: &str) {
    for _ in 0..120 {
        let status: serde_json::Value = client
            .get(format!(
                "{}/tubs/{tub}/documents/{document_id}/status",
                base_uri()
            ))
            .bearer_auth(token())
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status body");
        match status["status"].as_str() {
            Some("completed") => return,
            Some("failed") => panic!("document pipeline failed: {status}"),
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
    panic!("document never reached completed status");
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn upload_poll_download_roundtrip() {
    let client = client();
    let tub = "mfn-test";
    create_tub(&client, tub).await;

    let body = "This is test document content";
    let response = client
        .post(format!("{}/tubs/{tub}/documents", base_uri()))
        .bearer_auth(token())
        .header("Content-Type", "text/plain")
        .header("x-ragnar-filename", "test.txt")
        .header("x-ragnar-mfn-news-id", "test-id-12345")
        .body(body)
        .send()
        .await
        .expect("upload request");
    assert_eq!(response.status(), 201);

    let document: serde_json::Value = response.json().await.expect("document body");
    let document_id = document["document_id"].as_str().expect("document id");
    assert!(document_id.starts_with("doc_"));

    poll_until_completed(&client, tub, document_id).await;

    let download = client
        .get(format!(
            "{}/tubs/{tub}/documents/{document_id}/download",
            base_uri()
        ))
        .bearer_auth(token())
        .send()
        .await
        .expect("download request");
    assert_eq!(
        download
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    assert_eq!(download.text().await.expect("download body"), body);

    let chunks: Vec<serde_json::Value> = client
        .get(format!(
            "{}/tubs/{tub}/documents/{document_id}/chunks",
            base_uri()
        ))
        .bearer_auth(token())
        .send()
        .await
        .expect("chunks request")
        .json()
        .await
        .expect("chunks body");
    assert!(!chunks.is_empty(), "pipeline should have produced chunks");

    delete_tub(&client, tub).await;
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn filters_narrow_document_listings() {
    let client = client();
    let tub = "mfn-filter-test";
    create_tub(&client, tub).await;

    let response = client
        .post(format!("{}/tubs/{tub}/documents", base_uri()))
        .bearer_auth(token())
        .header("Content-Type", "text/plain")
        .header("x-ragnar-mfn-news-id", "test-id-12345")
        .body("filterable document")
        .send()
        .await
        .expect("upload request");
    assert_eq!(response.status(), 201);

    let matching: Vec<serde_json::Value> = client
        .get(format!("{}/tubs/{tub}/documents", base_uri()))
        .query(&[("filter", r#"{"mfn-news-id":"test-id-12345"}"#)])
        .bearer_auth(token())
        .send()
        .await
        .expect("filtered list")
        .json()
        .await
        .expect("filtered body");
    assert!(!matching.is_empty());

    let empty: Vec<serde_json::Value> = client
        .get(format!("{}/tubs/{tub}/documents", base_uri()))
        .query(&[("filter", r#"{"mfn-news-id":["nope"]}"#)])
        .bearer_auth(token())
        .send()
        .await
        .expect("membership list")
        .json()
        .await
        .expect("membership body");
    assert!(empty.is_empty());

    delete_tub(&client, tub).await;
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn client_supplied_markdown_and_chunks_bypass_stages() {
    let client = client();
    let tub = "mfn-multipart-test";
    create_tub(&client, tub).await;

    let markdown = "# Supplied\n\nauthoritative markdown";
    let chunks = serde_json::json!([
        { "chunk_id": 0, "content": "first supplied chunk" },
        { "chunk_id": 1, "content": "second supplied chunk" }
    ]);

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::text("original body")
                .file_name("orig.txt")
                .mime_str("text/plain")
                .expect("file part"),
        )
        .part(
            "markdown",
            reqwest::multipart::Part::text(markdown).file_name("doc.md"),
        )
        .part("chunks", reqwest::multipart::Part::text(chunks.to_string()));

    let response = client
        .post(format!("{}/tubs/{tub}/documents", base_uri()))
        .bearer_auth(token())
        .multipart(form)
        .send()
        .await
        .expect("multipart upload");
    assert_eq!(response.status(), 201);
    let document: serde_json::Value = response.json().await.expect("document body");
    let document_id = document["document_id"].as_str().expect("document id");

    poll_until_completed(&client, tub, document_id).await;

    let stored_markdown = client
        .get(format!(
            "{}/tubs/{tub}/documents/{document_id}/download/markdown",
            base_uri()
        ))
        .bearer_auth(token())
        .send()
        .await
        .expect("markdown download")
        .text()
        .await
        .expect("markdown body");
    assert_eq!(stored_markdown, markdown);

    let stored_chunks: Vec<serde_json::Value> = client
        .get(format!(
            "{}/tubs/{tub}/documents/{document_id}/chunks",
            base_uri()
        ))
        .bearer_auth(token())
        .send()
        .await
        .expect("chunks request")
        .json()
        .await
        .expect("chunks body");
    assert_eq!(stored_chunks.len(), 2);
    assert_eq!(stored_chunks[0]["content"], "first supplied chunk");
    assert_eq!(stored_chunks[1]["content"], "second supplied chunk");

    // Re-upload with three new chunks; exactly three must remain.
    let chunks = serde_json::json!([
        { "chunk_id": 0, "content": "replacement one" },
        { "chunk_id": 1, "content": "replacement two" },
        { "chunk_id": 2, "content": "replacement three" }
    ]);
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::text("original body")
                .file_name("orig.txt")
                .mime_str("text/plain")
                .expect("file part"),
        )
        .part(
            "markdown",
            reqwest::multipart::Part::text(markdown).file_name("doc.md"),
        )
        .part("chunks", reqwest::multipart::Part::text(chunks.to_string()));

    let response = client
        .put(format!(
            "{}/tubs/{tub}/documents/{document_id}",
            base_uri()
        ))
        .bearer_auth(token())
        .multipart(form)
        .send()
        .await
        .expect("multipart update");
    assert_eq!(response.status(), 201);

    poll_until_completed(&client, tub, document_id).await;

    let stored_chunks: Vec<serde_json::Value> = client
        .get(format!(
            "{}/tubs/{tub}/documents/{document_id}/chunks",
            base_uri()
        ))
        .bearer_auth(token())
        .send()
        .await
        .expect("chunks request")
        .json()
        .await
        .expect("chunks body");
    assert_eq!(stored_chunks.len(), 3);

    delete_tub(&client, tub).await;
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn chunks_without_markdown_are_rejected() {
    let client = client();
    let tub = "mfn-badmultipart-test";
    create_tub(&client, tub).await;

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::text("body")
                .file_name("orig.txt")
                .mime_str("text/plain")
                .expect("file part"),
        )
        .part(
            "chunks",
            reqwest::multipart::Part::text(r#"[{"chunk_id":0,"content":"c"}]"#),
        );

    let response = client
        .post(format!("{}/tubs/{tub}/documents", base_uri()))
        .bearer_auth(token())
        .multipart(form)
        .send()
        .await
        .expect("multipart upload");
    assert_eq!(response.status(), 400);
    let body = response.text().await.expect("error body");
    assert!(body.contains("chunks provided but markdown part is missing"));

    delete_tub(&client, tub).await;
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn required_header_enforcement_on_update() {
    let client = client();
    let tub = "mfn-required-test";
    create_tub(&client, tub).await;

    // A document without the soon-to-be-required header.
    let response = client
        .post(format!("{}/tubs/{tub}/documents", base_uri()))
        .bearer_auth(token())
        .header("Content-Type", "text/plain")
        .body("no custom header")
        .send()
        .await
        .expect("upload request");
    assert_eq!(response.status(), 201);
    let document: serde_json::Value = response.json().await.expect("document body");
    let document_id = document["document_id"].as_str().expect("document id");

    // Requiring it now must fail.
    let response = client
        .put(format!("{}/tubs/{tub}", base_uri()))
        .bearer_auth(token())
        .json(&serde_json::json!({
            "tub_name": tub,
            "settings": { "required_document_headers": "source" }
        }))
        .send()
        .await
        .expect("tub update");
    assert!(response.status().is_client_error());

    // Supply the header on the document, then the tub update succeeds.
    let response = client
        .put(format!(
            "{}/tubs/{tub}/documents/{document_id}",
            base_uri()
        ))
        .bearer_auth(token())
        .header("Content-Type", "text/plain")
        .header("x-ragnar-source", "feed")
        .body("no custom header")
        .send()
        .await
        .expect("document update");
    assert_eq!(response.status(), 201);

    let response = client
        .put(format!("{}/tubs/{tub}", base_uri()))
        .bearer_auth(token())
        .json(&serde_json::json!({
            "tub_name": tub,
            "settings": { "required_document_headers": "source" }
        }))
        .send()
        .await
        .expect("tub update");
    assert!(response.status().is_success());

    delete_tub(&client, tub).await;
}

#[tokio::test]
#[ignore = "Requires a running ragnard stack"]
async fn search_ranks_and_filters() {
    let client = client();
    let tub = "mfn-search-test";
    create_tub(&client, tub).await;

    let mut target_document_id = String::new();
    for (index, text) in [
        "The quarterly report covers revenue and churn.",
        "Kubernetes deployment notes for the ingestion service.",
        "A recipe for sourdough bread with a long cold proof.",
        "Incident review: object storage outage and recovery.",
    ]
    .iter()
    .enumerate()
    {
        let response = client
            .post(format!("{}/tubs/{tub}/documents", base_uri()))
            .bearer_auth(token())
            .header("Content-Type", "text/plain")
            .header("x-ragnar-mfn-news-id", format!("news-{index}"))
            .body(*text)
            .send()
            .await
            .expect("upload request");
        assert_eq!(response.status(), 201);
        let document: serde_json::Value = response.json().await.expect("document body");
        let id = document["document_id"].as_str().expect("document id");
        if index == 1 {
            target_document_id = id.to_string();
        }
        poll_until_completed(&client, tub, id).await;
    }

    let hits: Vec<serde_json::Value> = client
        .get(format!("{}/search/xnn/{tub}", base_uri()))
        .query(&[("q", "deployment"), ("limit", "3")])
        .bearer_auth(token())
        .send()
        .await
        .expect("search request")
        .json()
        .await
        .expect("search body");
    assert_eq!(hits.len(), 3);

    let filtered: Vec<serde_json::Value> = client
        .get(format!("{}/search/xnn/{tub}", base_uri()))
        .query(&[("q", "deployment"), ("filter", r#"{"mfn-news-id":"news-1"}"#)])
        .bearer_auth(token())
        .send()
        .await
        .expect("filtered search")
        .json()
        .await
        .expect("filtered body");
    assert!(!filtered.is_empty());
    for hit in &filtered {
        assert_eq!(hit["document_id"].as_str(), Some(target_document_id.as_str()));
    }

    delete_tub(&client, tub).await;
}
