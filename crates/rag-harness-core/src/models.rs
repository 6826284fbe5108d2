//! Core data models used throughout RAG Harness.
//!
//! These types represent the documents, chunks, and search results that flow
//! through the ingestion and retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ingestion lifecycle of a [`Document`].
///
/// A document only reaches [`Complete`](DocumentStatus::Complete) once every
/// chunk has a durably stored vector. Interrupted ingestions stay in
/// `Processing`; ingestions that hit an error end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "complete" => Ok(DocumentStatus::Complete),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// Source formats the loader can normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Text,
    Markdown,
    Code,
    Pdf,
    Epub,
    Docx,
    Fb2,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "java", "kt", "py", "js", "ts", "go", "c", "h", "cpp", "hpp", "cs", "rb", "sh", "sql",
    "toml", "yaml", "yml", "json",
];

impl SourceFormat {
    pub const ALL: [SourceFormat; 7] = [
        SourceFormat::Text,
        SourceFormat::Markdown,
        SourceFormat::Code,
        SourceFormat::Pdf,
        SourceFormat::Epub,
        SourceFormat::Docx,
        SourceFormat::Fb2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Text => "text",
            SourceFormat::Markdown => "markdown",
            SourceFormat::Code => "code",
            SourceFormat::Pdf => "pdf",
            SourceFormat::Epub => "epub",
            SourceFormat::Docx => "docx",
            SourceFormat::Fb2 => "fb2",
        }
    }

    /// Resolve a format from a file extension (without the leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "text" | "log" => Some(SourceFormat::Text),
            "md" | "markdown" => Some(SourceFormat::Markdown),
            "pdf" => Some(SourceFormat::Pdf),
            "epub" => Some(SourceFormat::Epub),
            "docx" => Some(SourceFormat::Docx),
            "fb2" => Some(SourceFormat::Fb2),
            e if CODE_EXTENSIONS.contains(&e) => Some(SourceFormat::Code),
            _ => None,
        }
    }

    /// Resolve a format from a MIME type. Parameters (`; charset=...`) are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/plain" => Some(SourceFormat::Text),
            "text/markdown" | "text/x-markdown" => Some(SourceFormat::Markdown),
            "application/pdf" => Some(SourceFormat::Pdf),
            "application/epub+zip" => Some(SourceFormat::Epub),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(SourceFormat::Docx)
            }
            "application/x-fictionbook+xml" | "application/x-fictionbook" => {
                Some(SourceFormat::Fb2)
            }
            "text/x-rust" | "text/x-java" | "text/x-python" | "text/javascript"
            | "application/javascript" | "text/x-c" | "text/x-go" => Some(SourceFormat::Code),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .or_else(|| SourceFormat::from_extension(s))
            .ok_or_else(|| format!("unsupported format: {}", s))
    }
}

/// Maps a character offset of normalized text back to its source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Character offset into the normalized text.
    pub offset: usize,
    /// 1-based page number, for paged formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Heading or section title in effect from `offset` onwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl Anchor {
    pub fn start() -> Self {
        Anchor {
            offset: 0,
            page: None,
            section: None,
        }
    }
}

/// An ingested document. Its text lives in its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub format: SourceFormat,
    pub size_bytes: u64,
    /// Unix seconds.
    pub ingested_at: i64,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub chunk_count: i64,
    pub metadata: serde_json::Value,
}

impl Document {
    /// A fresh `pending` document with a random id.
    pub fn new(name: impl Into<String>, format: SourceFormat, size_bytes: u64) -> Self {
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            format,
            size_bytes,
            ingested_at: chrono::Utc::now().timestamp(),
            status: DocumentStatus::Pending,
            error: None,
            chunk_count: 0,
            metadata: serde_json::json!({}),
        }
    }
}

/// A contiguous span of a document's normalized text with its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Character offset (inclusive) into the normalized text.
    pub start_offset: i64,
    /// Character offset (exclusive) into the normalized text.
    pub end_offset: i64,
    pub metadata: serde_json::Value,
    /// SHA-256 of `text`.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Neighbouring chunk texts attached to a [`SimilarityResult`] on request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// A ranked search hit. Built per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityResult {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ChunkContext>,
    /// Index-assigned insertion sequence; lower means created earlier.
    #[serde(skip)]
    pub seq: i64,
}

/// Restricts a search to part of the corpus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Only chunks of these documents. `None` means every document.
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn documents(ids: Vec<String>) -> Self {
        SearchFilter {
            document_ids: Some(ids),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_ids.is_none()
    }

    pub fn admits(&self, document_id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|id| id == document_id),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SourceFormat::from_extension("PDF"), Some(SourceFormat::Pdf));
        assert_eq!(SourceFormat::from_extension(".md"), Some(SourceFormat::Markdown));
        assert_eq!(SourceFormat::from_extension("rs"), Some(SourceFormat::Code));
        assert_eq!(SourceFormat::from_extension("xlsx"), None);
    }

    #[test]
    fn test_format_from_mime_ignores_parameters() {
        assert_eq!(
            SourceFormat::from_mime("text/plain; charset=utf-8"),
            Some(SourceFormat::Text)
        );
        assert_eq!(
            SourceFormat::from_mime("application/epub+zip"),
            Some(SourceFormat::Epub)
        );
        assert_eq!(SourceFormat::from_mime("image/png"), None);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Complete,
            DocumentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>(), Ok(status));
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_filter_admits() {
        let all = SearchFilter::default();
        assert!(all.admits("anything"));

        let some = SearchFilter::documents(vec!["a".into(), "b".into()]);
        assert!(some.admits("b"));
        assert!(!some.admits("c"));
    }

    #[test]
    fn test_similarity_result_serializes_camel_case_without_seq() {
        let r = SimilarityResult {
            chunk_id: "c".into(),
            document_id: "d".into(),
            document_name: "n".into(),
            chunk_index: 2,
            text: "t".into(),
            metadata: serde_json::json!({}),
            created_at: 1,
            score: 0.5,
            context: None,
            seq: 9,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["chunkIndex"], 2);
        assert_eq!(v["documentName"], "n");
        assert!(v.get("seq").is_none());
        assert!(v.get("context").is_none());
    }
}
