//! HTTP endpoint tests: a real server on an ephemeral port, called with
//! `reqwest`.

use std::sync::Arc;

use serde_json::{json, Value};

use rag_harness::config::Config;
use rag_harness::core::embedding::HashingEmbedder;
use rag_harness::core::store::memory::InMemoryIndex;
use rag_harness::pipeline::Pipeline;
use rag_harness::server;
use rag_harness::tools::ToolGateway;

/// Start a server over an empty in-memory index and return its base URL.
async fn spawn_server() -> String {
    let mut config = Config::with_db_path("unused.sqlite");
    config.chunking.chunk_size = 80;
    config.chunking.overlap = 10;
    let pipeline = Pipeline::new(
        Arc::new(InMemoryIndex::new()),
        Arc::new(HashingEmbedder::new(128)),
        &config,
    );
    let gateway = Arc::new(ToolGateway::with_builtins(Arc::new(pipeline)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(gateway)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_tools_list_has_schemas() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/tools/list", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let tools = body["tools"].as_array().unwrap();
    let names: Vec<_> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        [
            "search",
            "ingest_document",
            "list_documents",
            "get_document_info",
            "delete_document"
        ]
    );
    assert_eq!(tools[0]["inputSchema"]["type"], "object");
    assert_eq!(tools[0]["inputSchema"]["required"], json!(["query"]));
}

#[tokio::test]
async fn test_ingest_then_search_over_http() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let ingest = client
        .post(format!("{}/tools/ingest_document", base))
        .json(&json!({
            "name": "policy.txt",
            "content": "Our refund policy allows returns within 30 days of delivery."
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(ingest.status(), 200);
    let ingest: Value = ingest.json().await.unwrap();
    assert_eq!(ingest["success"], true);
    assert_eq!(ingest["toolName"], "ingest_document");

    let search = client
        .post(format!("{}/tools/execute", base))
        .json(&json!({
            "toolName": "search",
            "arguments": { "query": "refund policy", "topK": 3 }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(search.status(), 200);
    let search: Value = search.json().await.unwrap();
    assert_eq!(search["result"]["count"], 1);
    assert_eq!(search["result"]["results"][0]["documentName"], "policy.txt");
    assert!(search["metadata"]["durationMs"].is_u64());
}

#[tokio::test]
async fn test_unknown_tool_is_404() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/execute", base))
        .json(&json!({ "toolName": "nonexistent", "arguments": {} }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["toolName"], "nonexistent");
    assert_eq!(body["metadata"]["errorKind"], "UnknownTool");
}

#[tokio::test]
async fn test_invalid_arguments_are_400() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{}/tools/search", base))
        .json(&json!({ "topK": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["metadata"]["errorKind"], "InvalidArguments");

    let malformed = client
        .post(format!("{}/tools/search", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    let body: Value = malformed.json().await.unwrap();
    assert_eq!(body["toolName"], "search");
}

#[tokio::test]
async fn test_missing_document_is_404() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/get_document_info", base))
        .json(&json!({ "documentId": "no-such-id" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["metadata"]["errorKind"], "DocumentNotFound");
}

#[tokio::test]
async fn test_empty_body_uses_defaults() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/list_documents", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["count"], 0);
}
