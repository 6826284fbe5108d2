//! Tests for the SQLite-backed vector index.
//!
//! Each test opens a fresh database in a temporary directory, so the
//! migrations run every time.

use std::sync::Arc;

use tempfile::TempDir;

use rag_harness::config::Config;
use rag_harness::core::chunk::{make_chunk, TextSpan};
use rag_harness::core::embedding::HashingEmbedder;
use rag_harness::core::models::{Document, DocumentStatus, SearchFilter, SourceFormat};
use rag_harness::core::store::VectorIndex;
use rag_harness::ingest::IngestRequest;
use rag_harness::pipeline::Pipeline;
use rag_harness::sqlite_store::SqliteIndex;

const DIMS: usize = 128;

async fn open_index() -> (TempDir, Config, SqliteIndex) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data/rh.sqlite"));
    let index = SqliteIndex::open(&config).await.unwrap();
    (tmp, config, index)
}

/// Store a complete document whose chunks are `texts`, embedded with the
/// hashing embedder.
async fn store(index: &SqliteIndex, name: &str, texts: &[&str]) -> Document {
    let embedder = HashingEmbedder::new(DIMS);
    let mut doc = Document::new(name, SourceFormat::Text, 0);
    index.upsert_document(&doc).await.unwrap();

    let mut offset = 0;
    let chunks: Vec<_> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let span = TextSpan {
                index: i,
                start: offset,
                end: offset + t.chars().count(),
                text: t.to_string(),
            };
            offset = span.end;
            make_chunk(&doc.id, &span, serde_json::json!({}), embedder.embed_one(t))
        })
        .collect();
    index.upsert_chunks(&doc.id, &chunks).await.unwrap();

    index
        .set_status(&doc.id, DocumentStatus::Complete, None, chunks.len() as i64)
        .await
        .unwrap();
    doc.status = DocumentStatus::Complete;
    doc.chunk_count = chunks.len() as i64;
    doc
}

async fn count(index: &SqliteIndex, sql: &str, document_id: &str) -> i64 {
    sqlx::query_scalar(sql)
        .bind(document_id)
        .fetch_one(index.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, config, index) = open_index().await;
    index.close().await;
    rag_harness::migrate::run_migrations(&config).await.unwrap();
    let reopened = SqliteIndex::open(&config).await.unwrap();
    assert!(reopened.list_documents(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_similarity_search_orders_by_score() {
    let (_tmp, _config, index) = open_index().await;
    store(
        &index,
        "policy.txt",
        &[
            "Orders ship within two business days.",
            "Our refund policy allows returns within 30 days.",
            "Gift cards cannot be exchanged for cash.",
        ],
    )
    .await;

    let query = HashingEmbedder::new(DIMS).embed_one("refund policy");
    let results = index
        .similarity_search(&query, 2, &SearchFilter::default())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk_index, 1);
    assert_eq!(results[0].document_name, "policy.txt");
    assert!(results[0].score > results[1].score);
}

#[tokio::test]
async fn test_top_k_beyond_corpus_returns_everything() {
    let (_tmp, _config, index) = open_index().await;
    store(&index, "a.txt", &["one", "two"]).await;

    let query = HashingEmbedder::new(DIMS).embed_one("one");
    let results = index
        .similarity_search(&query, 50, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);

    let err = index
        .similarity_search(&query, 0, &SearchFilter::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidArguments");
}

#[tokio::test]
async fn test_equal_scores_keep_creation_order() {
    let (_tmp, _config, index) = open_index().await;
    let first = store(&index, "first.txt", &["identical text"]).await;
    let second = store(&index, "second.txt", &["identical text"]).await;

    let query = HashingEmbedder::new(DIMS).embed_one("identical text");
    let results = index
        .similarity_search(&query, 2, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(results[0].document_id, first.id);
    assert_eq!(results[1].document_id, second.id);
}

#[tokio::test]
async fn test_keyword_search_and_filter() {
    let (_tmp, _config, index) = open_index().await;
    let alpha = store(&index, "alpha.md", &["Build the project with cargo build."]).await;
    store(&index, "beta.md", &["Deploy with cargo and docker."]).await;
    store(&index, "gamma.txt", &["Nothing relevant here."]).await;

    let all = index
        .keyword_search("cargo", 10, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.score > 0.0 && r.score < 1.0));

    let filtered = index
        .keyword_search("cargo", 10, &SearchFilter::documents(vec![alpha.id.clone()]))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].document_id, alpha.id);

    let none = index
        .keyword_search("kubernetes", 10, &SearchFilter::default())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_keyword_search_tolerates_fts_syntax() {
    let (_tmp, _config, index) = open_index().await;
    store(&index, "a.txt", &["quoted \"text\" AND operators"]).await;

    let results = index
        .keyword_search("\"text\" AND (", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_incomplete_documents_are_not_searchable() {
    let (_tmp, _config, index) = open_index().await;
    let doc = store(&index, "a.txt", &["refund policy"]).await;
    index
        .set_status(&doc.id, DocumentStatus::Processing, None, 0)
        .await
        .unwrap();

    let query = HashingEmbedder::new(DIMS).embed_one("refund policy");
    let semantic = index
        .similarity_search(&query, 5, &SearchFilter::default())
        .await
        .unwrap();
    let keyword = index
        .keyword_search("refund", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(semantic.is_empty());
    assert!(keyword.is_empty());
}

#[tokio::test]
async fn test_get_chunks_range() {
    let (_tmp, _config, index) = open_index().await;
    let doc = store(&index, "a.txt", &["zero", "one", "two", "three"]).await;

    let middle = index.get_chunks(&doc.id, 1..=2).await.unwrap();
    let texts: Vec<_> = middle.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, ["one", "two"]);
    assert_eq!(middle[0].embedding.len(), DIMS);

    let all = index.get_chunks(&doc.id, 0..=i64::MAX).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn test_delete_leaves_no_orphans() {
    let (_tmp, _config, index) = open_index().await;
    let doc = store(&index, "a.txt", &["zero", "one", "two"]).await;
    let keep = store(&index, "b.txt", &["other"]).await;

    assert!(index.delete_document(&doc.id).await.unwrap());
    assert!(!index.delete_document(&doc.id).await.unwrap());

    assert_eq!(
        count(&index, "SELECT COUNT(*) FROM chunks WHERE document_id = ?", &doc.id).await,
        0
    );
    assert_eq!(
        count(&index, "SELECT COUNT(*) FROM chunks_fts WHERE document_id = ?", &doc.id).await,
        0
    );
    assert!(index.get_document(&doc.id).await.unwrap().is_none());
    assert_eq!(
        count(&index, "SELECT COUNT(*) FROM chunks WHERE document_id = ?", &keep.id).await,
        1
    );
}

#[tokio::test]
async fn test_set_status_on_missing_document() {
    let (_tmp, _config, index) = open_index().await;
    let err = index
        .set_status("missing", DocumentStatus::Failed, Some("boom"), 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "DocumentNotFound");
}

#[tokio::test]
async fn test_document_round_trip_and_listing() {
    let (_tmp, _config, index) = open_index().await;
    let mut doc = Document::new("report.pdf", SourceFormat::Pdf, 4096);
    doc.metadata = serde_json::json!({ "author": "ops" });
    index.upsert_document(&doc).await.unwrap();
    index
        .set_status(&doc.id, DocumentStatus::Failed, Some("bad xref"), 0)
        .await
        .unwrap();

    let stored = index.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.format, SourceFormat::Pdf);
    assert_eq!(stored.size_bytes, 4096);
    assert_eq!(stored.status, DocumentStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("bad xref"));
    assert_eq!(stored.metadata["author"], "ops");

    let by_name = index.find_document_by_name("report.pdf").await.unwrap();
    assert_eq!(by_name.unwrap().id, doc.id);

    let failed = index
        .list_documents(Some(DocumentStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let complete = index
        .list_documents(Some(DocumentStatus::Complete))
        .await
        .unwrap();
    assert!(complete.is_empty());
}

#[tokio::test]
async fn test_reingest_replaces_chunks() {
    let (_tmp, config, index) = open_index().await;
    let mut config = config;
    config.chunking.chunk_size = 40;
    config.chunking.overlap = 5;
    let index = Arc::new(index);
    let pipeline = Pipeline::new(index.clone(), Arc::new(HashingEmbedder::new(DIMS)), &config);

    let long = "First paragraph about shipping.\n\nSecond paragraph about refunds.\n\n\
                Third paragraph about gift cards.";
    let first = pipeline
        .ingestor
        .ingest(IngestRequest::new("notes.txt", long.as_bytes().to_vec()))
        .await
        .unwrap();
    assert!(first.chunk_count > 1);
    assert!(!first.replaced);

    let second = pipeline
        .ingestor
        .ingest(IngestRequest::new("notes.txt", b"Short now.".to_vec()))
        .await
        .unwrap();
    assert!(second.replaced);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(second.chunk_count, 1);

    assert_eq!(
        count(
            &index,
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?",
            &first.document_id
        )
        .await,
        1
    );
    assert_eq!(
        count(
            &index,
            "SELECT COUNT(*) FROM chunks_fts WHERE document_id = ?",
            &first.document_id
        )
        .await,
        1
    );
    assert_eq!(index.list_documents(None).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingestion_into_sqlite() {
    let (_tmp, mut config, index) = open_index().await;
    config.ingest.max_concurrent_documents = 8;
    let index = Arc::new(index);
    let pipeline = Pipeline::new(index.clone(), Arc::new(HashingEmbedder::new(DIMS)), &config);

    let requests = (0..8)
        .map(|i| {
            IngestRequest::new(
                format!("doc{i}.txt"),
                format!("Document number {i} covers topic {i} in some detail.").into_bytes(),
            )
        })
        .collect();
    let outcomes = pipeline.ingestor.ingest_many(requests).await;

    let failures: Vec<_> = outcomes
        .iter()
        .filter_map(|(name, r)| r.as_ref().err().map(|e| format!("{name}: {e}")))
        .collect();
    assert!(failures.is_empty(), "{:?}", failures);

    let complete = index
        .list_documents(Some(DocumentStatus::Complete))
        .await
        .unwrap();
    assert_eq!(complete.len(), 8);
    for doc in &complete {
        assert_eq!(
            count(&index, "SELECT COUNT(*) FROM chunks WHERE document_id = ?", &doc.id).await,
            doc.chunk_count
        );
    }
}
