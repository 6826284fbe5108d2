//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Vectors are stored as little-endian f32 BLOBs on the chunk rows and
//! searched by brute-force cosine similarity in Rust. Keyword search goes
//! through the `chunks_fts` FTS5 table.
//!
//! Chunk replacement and document deletion each run in one `BEGIN
//! IMMEDIATE` transaction, so WAL readers see either the previous chunk set
//! or the new one, and concurrent writers queue on the busy timeout instead
//! of failing a read-to-write upgrade.

use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use rag_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use rag_harness_core::models::{
    Chunk, Document, DocumentStatus, SearchFilter, SimilarityResult, SourceFormat,
};
use rag_harness_core::search::{query_terms, rank};
use rag_harness_core::store::VectorIndex;
use rag_harness_core::{RagError, Result};

use crate::config::Config;
use crate::migrate;

/// Open (creating if needed) the SQLite database named in `[db].path`.
pub async fn connect(config: &Config) -> AnyResult<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5))
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// SQLite implementation of [`VectorIndex`].
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

const SEARCH_COLUMNS: &str = "c.seq, c.id, c.document_id, d.name AS document_name, \
     c.chunk_index, c.text, c.metadata_json, c.created_at";

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &Config) -> AnyResult<Self> {
        let pool = connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let format: String = row.get("format");
    let status: String = row.get("status");
    let size_bytes: i64 = row.get("size_bytes");
    let metadata_json: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        name: row.get("name"),
        format: SourceFormat::from_str(&format).map_err(RagError::storage)?,
        size_bytes: size_bytes.max(0) as u64,
        ingested_at: row.get("ingested_at"),
        status: DocumentStatus::from_str(&status).map_err(RagError::storage)?,
        error: row.get("error"),
        chunk_count: row.get("chunk_count"),
        metadata: parse_json(&metadata_json),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let metadata_json: String = row.get("metadata_json");
    let blob: Vec<u8> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        metadata: parse_json(&metadata_json),
        hash: row.get("hash"),
        embedding: blob_to_vec(&blob),
        created_at: row.get("created_at"),
    }
}

fn row_to_result(row: &SqliteRow, score: f64) -> SimilarityResult {
    let metadata_json: String = row.get("metadata_json");
    SimilarityResult {
        chunk_id: row.get("id"),
        document_id: row.get("document_id"),
        document_name: row.get("document_name"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        metadata: parse_json(&metadata_json),
        created_at: row.get("created_at"),
        score,
        context: None,
        seq: row.get("seq"),
    }
}

/// Append `AND c.document_id IN (...)` for a document filter.
fn push_document_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &SearchFilter) {
    if let Some(ids) = &filter.document_ids {
        if ids.is_empty() {
            qb.push(" AND 0");
            return;
        }
        qb.push(" AND c.document_id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");
    }
}

/// FTS5 MATCH expression: every query term quoted, OR-ed together.
fn fts_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, format, size_bytes, ingested_at, status,
                                   error, chunk_count, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                format = excluded.format,
                size_bytes = excluded.size_bytes,
                ingested_at = excluded.ingested_at,
                status = excluded.status,
                error = excluded.error,
                chunk_count = excluded.chunk_count,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.name)
        .bind(doc.format.as_str())
        .bind(doc.size_bytes as i64)
        .bind(doc.ingested_at)
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .bind(doc.chunk_count)
        .bind(doc.metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(RagError::storage)?;

        Ok(())
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
        chunk_count: i64,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE documents SET status = ?, error = ?, chunk_count = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(chunk_count)
                .bind(document_id)
                .execute(&self.pool)
                .await
                .map_err(RagError::storage)?;

        if result.rows_affected() == 0 {
            return Err(RagError::DocumentNotFound(document_id.to_string()));
        }
        Ok(())
    }

    async fn upsert_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(RagError::storage)?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(RagError::storage)?;
        if !exists {
            return Err(RagError::DocumentNotFound(document_id.to_string()));
        }

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, start_offset,
                                    end_offset, metadata_json, hash, embedding, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.metadata.to_string())
            .bind(&chunk.hash)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(chunk.embedding.len() as i64)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(RagError::storage)?;
        }

        tx.commit().await.map_err(RagError::storage)?;
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

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(SEARCH_COLUMNS);
        qb.push(
            ", c.embedding FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE d.status = 'complete'",
        );
        push_document_filter(&mut qb, filter);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(RagError::storage)?;

        let candidates: Vec<SimilarityResult> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query, &blob_to_vec(&blob)) as f64;
                row_to_result(row, score)
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
        let expression = match fts_expression(query) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(SEARCH_COLUMNS);
        qb.push(
            ", bm25(chunks_fts) AS bm25_score FROM chunks_fts \
             JOIN chunks c ON c.id = chunks_fts.chunk_id \
             JOIN documents d ON d.id = c.document_id \
             WHERE chunks_fts MATCH ",
        );
        qb.push_bind(expression);
        qb.push(" AND d.status = 'complete'");
        push_document_filter(&mut qb, filter);
        qb.push(" ORDER BY bm25_score ASC, c.seq ASC LIMIT ");
        qb.push_bind(top_k as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(RagError::storage)?;

        // bm25() is lower-is-better and non-positive; fold it into [0, 1).
        let candidates: Vec<SimilarityResult> = rows
            .iter()
            .map(|row| {
                let bm25: f64 = row.get("bm25_score");
                let r = (-bm25).max(0.0);
                row_to_result(row, r / (1.0 + r))
            })
            .collect();

        Ok(rank(candidates, top_k))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RagError::storage)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_document_by_name(&self, name: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE name = ? ORDER BY ingested_at DESC, id ASC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::storage)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM documents WHERE status = ? ORDER BY ingested_at DESC, id ASC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM documents ORDER BY ingested_at DESC, id ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(RagError::storage)?;

        rows.iter().map(row_to_document).collect()
    }

    async fn get_chunks(
        &self,
        document_id: &str,
        range: RangeInclusive<i64>,
    ) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? AND chunk_index BETWEEN ? AND ? \
             ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .bind(*range.start())
        .bind(*range.end())
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::storage)?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(RagError::storage)?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        tx.commit().await.map_err(RagError::storage)?;
        Ok(result.rows_affected() > 0)
    }
}
