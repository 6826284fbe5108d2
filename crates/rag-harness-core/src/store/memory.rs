//! In-memory [`VectorIndex`] implementation for tests and embedding
//! into other programs.
//!
//! All state sits behind one `std::sync::RwLock`, so a chunk replacement or
//! a delete is a single write-locked step and concurrent readers never see
//! half of it. Vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Document, DocumentStatus, SearchFilter, SimilarityResult};
use crate::search::{keyword_score, rank, query_terms};

use super::VectorIndex;

struct StoredChunk {
    seq: i64,
    chunk: Chunk,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    chunks: Vec<StoredChunk>,
    next_seq: i64,
}

/// In-memory index.
pub struct InMemoryIndex {
    inner: RwLock<Inner>,
    pushdown: bool,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            pushdown: true,
        }
    }

    /// An index that ignores [`SearchFilter`]s and reports no pushdown
    /// support, leaving filtering to the caller.
    pub fn without_filter_pushdown() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            pushdown: false,
        }
    }

    /// Number of stored chunks across all documents.
    pub fn chunk_count(&self) -> usize {
        self.inner.read().map(|g| g.chunks.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| RagError::storage("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| RagError::storage("in-memory index lock poisoned"))
    }

    fn effective_filter<'a>(&self, filter: &'a SearchFilter) -> Option<&'a SearchFilter> {
        self.pushdown.then_some(filter)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn to_result(doc: &Document, stored: &StoredChunk, score: f64) -> SimilarityResult {
    SimilarityResult {
        chunk_id: stored.chunk.id.clone(),
        document_id: stored.chunk.document_id.clone(),
        document_name: doc.name.clone(),
        chunk_index: stored.chunk.chunk_index,
        text: stored.chunk.text.clone(),
        metadata: stored.chunk.metadata.clone(),
        created_at: stored.chunk.created_at,
        score,
        context: None,
        seq: stored.seq,
    }
}

impl Inner {
    /// Chunks that are visible to search under `filter`, with their document.
    fn searchable<'a>(
        &'a self,
        filter: Option<&'a SearchFilter>,
    ) -> impl Iterator<Item = (&'a Document, &'a StoredChunk)> + 'a {
        self.chunks.iter().filter_map(move |sc| {
            let doc = self.docs.get(&sc.chunk.document_id)?;
            if doc.status != DocumentStatus::Complete {
                return None;
            }
            if let Some(f) = filter {
                if !f.admits(&doc.id) {
                    return None;
                }
            }
            Some((doc, sc))
        })
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut inner = self.write()?;
        inner.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
        chunk_count: i64,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let doc = inner
            .docs
            .get_mut(document_id)
            .ok_or_else(|| RagError::DocumentNotFound(document_id.to_string()))?;
        doc.status = status;
        doc.error = error.map(str::to_string);
        doc.chunk_count = chunk_count;
        Ok(())
    }

    async fn upsert_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.write()?;
        if !inner.docs.contains_key(document_id) {
            return Err(RagError::DocumentNotFound(document_id.to_string()));
        }
        inner.chunks.retain(|sc| sc.chunk.document_id != document_id);
        for c in chunks {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let mut chunk = c.clone();
            chunk.document_id = document_id.to_string();
            inner.chunks.push(StoredChunk { seq, chunk });
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SimilarityResult>> {
        if top_k == 0 {
            return Err(RagError::invalid("topK must be a positive integer"));
        }
        let inner = self.read()?;
        let candidates: Vec<SimilarityResult> = inner
            .searchable(self.effective_filter(filter))
            .map(|(doc, sc)| {
                let score = cosine_similarity(query, &sc.chunk.embedding) as f64;
                to_result(doc, sc, score)
            })
            .collect();
        Ok(rank(candidates, top_k))
    }

    async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SimilarityResult>> {
        if top_k == 0 {
            return Err(RagError::invalid("topK must be a positive integer"));
        }
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let candidates: Vec<SimilarityResult> = inner
            .searchable(self.effective_filter(filter))
            .filter_map(|(doc, sc)| {
                let score = keyword_score(&terms, &sc.chunk.text);
                (score > 0.0).then(|| to_result(doc, sc, score))
            })
            .collect();
        Ok(rank(candidates, top_k))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn find_document_by_name(&self, name: &str) -> Result<Option<Document>> {
        let inner = self.read()?;
        let mut matches: Vec<&Document> =
            inner.docs.values().filter(|d| d.name == name).collect();
        matches.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at).then(a.id.cmp(&b.id)));
        Ok(matches.first().map(|d| (*d).clone()))
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let inner = self.read()?;
        let mut docs: Vec<Document> = inner
            .docs
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn get_chunks(
        &self,
        document_id: &str,
        range: RangeInclusive<i64>,
    ) -> Result<Vec<Chunk>> {
        let inner = self.read()?;
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .iter()
            .filter(|sc| {
                sc.chunk.document_id == document_id && range.contains(&sc.chunk.chunk_index)
            })
            .map(|sc| sc.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut inner = self.write()?;
        let existed = inner.docs.remove(id).is_some();
        inner.chunks.retain(|sc| sc.chunk.document_id != id);
        Ok(existed)
    }

    fn supports_filter_pushdown(&self) -> bool {
        self.pushdown
    }
}
