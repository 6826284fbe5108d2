//! Vector index abstraction for RAG Harness.
//!
//! The [`VectorIndex`] trait defines every storage operation the ingestion
//! and retrieval pipeline needs, so the pipeline runs unchanged against
//! SQLite or the in-memory [`InMemoryIndex`](memory::InMemoryIndex).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Visibility rules
//!
//! - Only chunks of documents whose status is
//!   [`Complete`](crate::models::DocumentStatus::Complete) are searchable.
//! - [`upsert_chunks`](VectorIndex::upsert_chunks) replaces a document's
//!   chunk set atomically; readers see either the old set or the new one.
//! - [`delete_document`](VectorIndex::delete_document) removes the document
//!   and all of its chunks in one step.

pub mod memory;

use std::ops::RangeInclusive;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Chunk, Document, DocumentStatus, SearchFilter, SimilarityResult};

/// Abstract document/chunk/vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](VectorIndex::upsert_document) | Insert or update a document record |
/// | [`set_status`](VectorIndex::set_status) | Move a document through its lifecycle |
/// | [`upsert_chunks`](VectorIndex::upsert_chunks) | Replace a document's chunks and vectors |
/// | [`similarity_search`](VectorIndex::similarity_search) | Cosine nearest neighbours |
/// | [`keyword_search`](VectorIndex::keyword_search) | Term matching, scores in `[0, 1]` |
/// | [`delete_document`](VectorIndex::delete_document) | Remove a document and its chunks |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    /// Update status, error message and chunk count of a document.
    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
        chunk_count: i64,
    ) -> Result<()>;

    /// Replace all chunks of `document_id` with `chunks`.
    ///
    /// Every chunk must carry its embedding.
    async fn upsert_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Top `top_k` chunks by cosine similarity to `query`, highest first,
    /// ties broken by creation order.
    ///
    /// Fails with `InvalidArguments` when `top_k == 0`. A `top_k` above the
    /// corpus size returns the whole corpus.
    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SimilarityResult>>;

    /// Top `top_k` chunks matching the terms of `query`, scores in `[0, 1]`.
    async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SimilarityResult>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_name(&self, name: &str) -> Result<Option<Document>>;

    /// All documents, newest first, optionally restricted to one status.
    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>>;

    /// Chunks of a document whose index falls in `range`, in index order.
    async fn get_chunks(&self, document_id: &str, range: RangeInclusive<i64>)
        -> Result<Vec<Chunk>>;

    /// Delete a document and all of its chunks. Returns `false` when the
    /// document did not exist.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Whether [`SearchFilter`]s passed to the search methods are honoured.
    /// When `false` the caller filters the returned candidates itself.
    fn supports_filter_pushdown(&self) -> bool {
        true
    }
}
