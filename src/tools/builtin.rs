//! Built-in tools over the ingestion and retrieval services.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use rag_harness_core::models::{DocumentStatus, SourceFormat};
use rag_harness_core::search::{MergeStrategy, SearchMode};
use rag_harness_core::{RagError, Result};

use super::Tool;
use crate::config::RetrievalConfig;
use crate::ingest::IngestRequest;
use crate::pipeline::Pipeline;
use crate::retrieve::RetrievalQuery;

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    match str_arg(args, key).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(RagError::invalid(format!("{} must not be empty", key))),
    }
}

/// Semantic, keyword or hybrid search. Delegates to the retriever.
pub struct SearchTool {
    default_top_k: usize,
    max_top_k: usize,
}

impl SearchTool {
    pub fn new(retrieval: &RetrievalConfig) -> Self {
        SearchTool {
            default_top_k: retrieval.default_top_k,
            max_top_k: retrieval.max_top_k,
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search ingested documents and return the most relevant chunks"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "topK": {
                    "type": "integer",
                    "description": "Maximum number of results",
                    "minimum": 1,
                    "maximum": self.max_top_k,
                    "default": self.default_top_k
                },
                "mode": {
                    "type": "string",
                    "enum": ["semantic", "keyword", "hybrid"],
                    "default": "semantic"
                },
                "threshold": {
                    "type": "number",
                    "description": "Drop results scoring below this value"
                },
                "documentIds": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Only search these documents"
                },
                "includeContext": {
                    "type": "boolean",
                    "description": "Attach the neighbouring chunk texts",
                    "default": false
                },
                "maxPerDocument": {
                    "type": "integer",
                    "description": "Keep at most this many chunks per document",
                    "minimum": 1
                },
                "dedupe": {
                    "type": "boolean",
                    "description": "Drop near-duplicate chunk texts",
                    "default": false
                },
                "mergeStrategy": {
                    "type": "string",
                    "enum": ["weighted_sum", "max_score", "rrf"],
                    "description": "How hybrid mode combines semantic and keyword scores"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value> {
        let mode: SearchMode = str_arg(&args, "mode")
            .unwrap_or("semantic")
            .parse()
            .map_err(RagError::InvalidArguments)?;
        let merge_strategy = str_arg(&args, "mergeStrategy")
            .map(str::parse::<MergeStrategy>)
            .transpose()
            .map_err(RagError::InvalidArguments)?;

        let query = RetrievalQuery {
            text: required_str(&args, "query")?.to_string(),
            top_k: args["topK"].as_u64().map(|k| k as usize),
            document_ids: args.get("documentIds").and_then(Value::as_array).map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
            mode,
            min_score: args["threshold"].as_f64(),
            with_context: args["includeContext"].as_bool().unwrap_or(false),
            max_per_document: args["maxPerDocument"].as_u64().map(|n| n as usize),
            dedupe: args["dedupe"].as_bool().unwrap_or(false),
            merge_strategy,
        };

        let results = pipeline.retriever.retrieve(&query).await?;
        Ok(json!({ "results": results, "count": results.len() }))
    }
}

/// Ingest inline text or base64-encoded bytes.
pub struct IngestDocumentTool;

#[async_trait]
impl Tool for IngestDocumentTool {
    fn name(&self) -> &str {
        "ingest_document"
    }

    fn description(&self) -> &str {
        "Load, chunk, embed and index a document; replaces an earlier document of the same name"
    }

    fn input_schema(&self) -> Value {
        let formats: Vec<&str> = SourceFormat::ALL.iter().map(|f| f.as_str()).collect();
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Document name, usually the file name"
                },
                "content": { "type": "string", "description": "Document text" },
                "contentBase64": {
                    "type": "string",
                    "description": "Base64-encoded document bytes, for binary formats"
                },
                "format": {
                    "type": "string",
                    "enum": formats,
                    "description": "Source format; detected from the name or content if omitted"
                },
                "metadata": { "type": "object" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value> {
        let name = required_str(&args, "name")?;
        let bytes = match (str_arg(&args, "content"), str_arg(&args, "contentBase64")) {
            (Some(text), None) => text.as_bytes().to_vec(),
            (None, Some(encoded)) => STANDARD
                .decode(encoded.trim())
                .map_err(|e| RagError::invalid(format!("contentBase64: {}", e)))?,
            (Some(_), Some(_)) => {
                return Err(RagError::invalid(
                    "pass either content or contentBase64, not both",
                ))
            }
            (None, None) => return Err(RagError::invalid("content or contentBase64 is required")),
        };

        let mut request = IngestRequest::new(name, bytes);
        if let Some(format) = str_arg(&args, "format") {
            let format: SourceFormat = format.parse().map_err(RagError::UnsupportedFormat)?;
            request = request.with_format(format);
        }
        request.metadata = args.get("metadata").cloned();

        let report = pipeline.ingestor.ingest(request).await?;
        Ok(json!(report))
    }
}

pub struct ListDocumentsTool;

#[async_trait]
impl Tool for ListDocumentsTool {
    fn name(&self) -> &str {
        "list_documents"
    }

    fn description(&self) -> &str {
        "List ingested documents, newest first"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["pending", "processing", "complete", "failed"]
                }
            }
        })
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value> {
        let status = str_arg(&args, "status")
            .map(str::parse::<DocumentStatus>)
            .transpose()
            .map_err(RagError::InvalidArguments)?;
        let documents = pipeline.index.list_documents(status).await?;
        Ok(json!({ "documents": documents, "count": documents.len() }))
    }
}

pub struct GetDocumentInfoTool;

#[async_trait]
impl Tool for GetDocumentInfoTool {
    fn name(&self) -> &str {
        "get_document_info"
    }

    fn description(&self) -> &str {
        "Get a document's record, optionally with its chunks"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "documentId": { "type": "string" },
                "includeChunks": { "type": "boolean", "default": false }
            },
            "required": ["documentId"]
        })
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value> {
        let id = required_str(&args, "documentId")?;
        let document = pipeline
            .index
            .get_document(id)
            .await?
            .ok_or_else(|| RagError::DocumentNotFound(id.to_string()))?;

        let mut info = json!({ "document": document });
        if args["includeChunks"].as_bool().unwrap_or(false) {
            let mut chunks = pipeline.index.get_chunks(id, 0..=i64::MAX).await?;
            for chunk in &mut chunks {
                chunk.embedding.clear();
            }
            info["chunks"] = json!(chunks);
        }
        Ok(info)
    }
}

pub struct DeleteDocumentTool;

#[async_trait]
impl Tool for DeleteDocumentTool {
    fn name(&self) -> &str {
        "delete_document"
    }

    fn description(&self) -> &str {
        "Delete a document and all of its chunks, by id or by name"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "documentId": { "type": "string" },
                "name": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value> {
        let id = match (str_arg(&args, "documentId"), str_arg(&args, "name")) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(name)) => pipeline
                .index
                .find_document_by_name(name)
                .await?
                .map(|d| d.id),
            (None, None) => return Err(RagError::invalid("documentId or name is required")),
        };

        let deleted = match &id {
            Some(id) => pipeline.ingestor.delete_document(id).await?,
            None => false,
        };
        Ok(json!({ "deleted": deleted, "documentId": id }))
    }
}
