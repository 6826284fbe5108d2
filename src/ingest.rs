//! Ingestion pipeline orchestration.
//!
//! Coordinates one document through load → chunk → embed → store:
//!
//! 1. Reject oversize input and unresolvable formats before anything is
//!    written.
//! 2. Create (or, for a known name, reuse) the document record and mark it
//!    `processing`.
//! 3. Extract text off the async runtime, chunk it, embed every chunk.
//! 4. Replace the document's chunks, then flip it to `complete`.
//!
//! Any failure, including the overall deadline, clears the document's
//! chunks and marks it `failed` with the error message. A dropped ingestion future leaves the
//! document `processing`, so its chunks never become searchable.
//!
//! Work on one document name is serialized by a per-name async mutex;
//! different documents ingest concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use rag_harness_core::chunk::{anchor_at, chunk_text, make_chunk, ChunkParams, TextSpan};
use rag_harness_core::models::{Anchor, Document, DocumentStatus, SourceFormat};
use rag_harness_core::store::VectorIndex;
use rag_harness_core::{RagError, Result};

use crate::config::IngestConfig;
use crate::embedding::EmbeddingClient;
use crate::loader::{self, Extraction, FormatHint};

/// A document to ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Display name; also the identity used to replace earlier versions.
    pub name: String,
    pub bytes: Vec<u8>,
    pub hint: FormatHint,
    /// Caller metadata merged into the document record.
    pub metadata: Option<serde_json::Value>,
}

impl IngestRequest {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        IngestRequest {
            hint: FormatHint::from_name(&name),
            name,
            bytes,
            metadata: None,
        }
    }

    pub fn with_format(mut self, format: SourceFormat) -> Self {
        self.hint.format = Some(format);
        self
    }

    /// Read a file; the path as given becomes the document name.
    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(path.display().to_string(), bytes))
    }
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub name: String,
    pub format: SourceFormat,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    /// Extraction problems that were tolerated.
    pub warnings: Vec<String>,
    /// An earlier version with the same name was replaced.
    pub replaced: bool,
    pub duration_ms: u64,
}

pub struct Ingestor {
    index: Arc<dyn VectorIndex>,
    embeddings: EmbeddingClient,
    params: ChunkParams,
    settings: IngestConfig,
    locks: LockTable,
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A handle on one name's ingestion mutex. The table entry is removed when
/// the last handle for that name drops, including on cancellation.
struct NameLock<'a> {
    table: &'a LockTable,
    name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for NameLock<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            // The table and this handle hold the only references.
            if Arc::strong_count(&self.lock) == 2 {
                table.remove(&self.name);
            }
        }
    }
}

impl Ingestor {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: EmbeddingClient,
        params: ChunkParams,
        settings: IngestConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            params,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, name: &str) -> Result<NameLock<'_>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| RagError::storage("ingestion lock table poisoned"))?;
        let lock = locks.entry(name.to_string()).or_default().clone();
        Ok(NameLock {
            table: &self.locks,
            name: name.to_string(),
            lock,
        })
    }

    /// Number of names with an ingestion or delete in flight.
    pub fn active_names(&self) -> usize {
        self.locks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Ingest one document.
    ///
    /// # Errors
    ///
    /// - `InvalidArguments` for an empty name or oversize input.
    /// - `UnsupportedFormat` when no parser applies; no record is created.
    /// - Any pipeline error, after the document has been marked `failed`.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        let started = Instant::now();
        let IngestRequest {
            name,
            bytes,
            hint,
            metadata,
        } = request;

        if name.trim().is_empty() {
            return Err(RagError::invalid("document name must not be empty"));
        }
        if bytes.len() as u64 > self.settings.max_document_bytes {
            return Err(RagError::invalid(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                self.settings.max_document_bytes
            )));
        }
        let format = loader::resolve_format(&bytes, &hint)?;

        let lock = self.lock_for(&name)?;
        let _guard = lock.lock.lock().await;

        let existing = self.index.find_document_by_name(&name).await?;
        let replaced = existing.is_some();
        let mut doc = match existing {
            Some(mut d) => {
                d.format = format;
                d.size_bytes = bytes.len() as u64;
                d.ingested_at = chrono::Utc::now().timestamp();
                d
            }
            None => Document::new(name.clone(), format, bytes.len() as u64),
        };
        doc.status = DocumentStatus::Processing;
        doc.error = None;
        doc.chunk_count = 0;
        doc.metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        self.index.upsert_document(&doc).await?;
        info!(document = %doc.id, name = %doc.name, format = %format, "ingesting document");

        let deadline = Duration::from_secs(self.settings.timeout_secs);
        let work = self.process(&doc.id, bytes, format);
        let outcome = match tokio::time::timeout(deadline, work).await {
            Ok(r) => r,
            Err(_) => Err(RagError::Cancelled(format!(
                "ingestion exceeded its {}s deadline",
                self.settings.timeout_secs
            ))),
        };

        match outcome {
            Ok((chunk_count, warnings)) => {
                if !warnings.is_empty() {
                    if let Some(obj) = doc.metadata.as_object_mut() {
                        obj.insert("warnings".to_string(), serde_json::json!(warnings));
                    }
                }
                doc.status = DocumentStatus::Complete;
                doc.chunk_count = chunk_count as i64;
                self.index.upsert_document(&doc).await?;

                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    document = %doc.id,
                    chunks = chunk_count,
                    duration_ms,
                    "document complete"
                );
                Ok(IngestReport {
                    document_id: doc.id,
                    name: doc.name,
                    format,
                    status: DocumentStatus::Complete,
                    chunk_count,
                    warnings,
                    replaced,
                    duration_ms,
                })
            }
            Err(e) => {
                warn!(document = %doc.id, kind = e.kind(), error = %e, "ingestion failed");
                // A replaced document must not keep its previous chunk set.
                if let Err(clear) = self.index.upsert_chunks(&doc.id, &[]).await {
                    warn!(document = %doc.id, error = %clear, "could not clear chunks");
                }
                if let Err(status) = self
                    .index
                    .set_status(&doc.id, DocumentStatus::Failed, Some(&e.to_string()), 0)
                    .await
                {
                    warn!(document = %doc.id, error = %status, "could not mark document failed");
                }
                Err(e)
            }
        }
    }

    /// Load, chunk, embed and store. Returns the chunk count and any
    /// tolerated extraction warnings.
    async fn process(
        &self,
        document_id: &str,
        bytes: Vec<u8>,
        format: SourceFormat,
    ) -> Result<(usize, Vec<String>)> {
        let loaded = tokio::task::spawn_blocking(move || loader::load_as(&bytes, format))
            .await
            .unwrap_or_else(|e| {
                Err(RagError::PartialExtraction {
                    text: String::new(),
                    anchors: Vec::new(),
                    reason: format!("{} parser crashed: {}", format, e),
                })
            });

        let mut warnings = Vec::new();
        let extraction = match loaded {
            Ok(ex) => ex,
            Err(RagError::PartialExtraction {
                text,
                anchors,
                reason,
            }) if self.settings.accept_partial => {
                warn!(document = %document_id, %reason, "indexing partial extraction");
                warnings.push(reason);
                Extraction {
                    format,
                    text,
                    anchors,
                }
            }
            Err(e) => return Err(e),
        };

        let spans = chunk_text(&extraction.text, &self.params);
        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embeddings.embed_all(&texts).await?;

        let total = spans.len();
        let chunks: Vec<_> = spans
            .iter()
            .zip(vectors)
            .map(|(span, vector)| {
                let metadata = chunk_metadata(span, &extraction.anchors, total);
                make_chunk(document_id, span, metadata, vector)
            })
            .collect();

        self.index.upsert_chunks(document_id, &chunks).await?;
        Ok((total, warnings))
    }

    /// Delete a document and its chunks. Waits for any in-flight
    /// ingestion of the same name. Returns `false` for an unknown id.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let Some(doc) = self.index.get_document(document_id).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&doc.name)?;
        let _guard = lock.lock.lock().await;
        let deleted = self.index.delete_document(&doc.id).await?;
        if deleted {
            info!(document = %doc.id, name = %doc.name, "document deleted");
        }
        Ok(deleted)
    }

    /// Ingest several documents, at most `max_concurrent_documents` at a
    /// time. Results come back in completion order, keyed by name.
    pub async fn ingest_many(
        &self,
        requests: Vec<IngestRequest>,
    ) -> Vec<(String, Result<IngestReport>)> {
        futures::stream::iter(requests)
            .map(|request| async move {
                let name = request.name.clone();
                (name, self.ingest(request).await)
            })
            .buffer_unordered(self.settings.max_concurrent_documents.max(1))
            .collect()
            .await
    }
}

fn chunk_metadata(span: &TextSpan, anchors: &[Anchor], total: usize) -> serde_json::Value {
    let mut meta = serde_json::json!({
        "chunk_size": span.end - span.start,
        "position": span.index,
        "total_chunks": total,
    });
    if let (Some(anchor), Some(obj)) = (anchor_at(anchors, span.start), meta.as_object_mut()) {
        if let Some(page) = anchor.page {
            obj.insert("page".to_string(), serde_json::json!(page));
        }
        if let Some(section) = &anchor.section {
            obj.insert("section".to_string(), serde_json::json!(section));
        }
    }
    meta
}
