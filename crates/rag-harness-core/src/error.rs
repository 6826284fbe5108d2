//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Every failure that can leave a pipeline component is one of the
//! [`RagError`] variants. Each variant has a stable [`kind`](RagError::kind)
//! string that the tool gateway copies into result metadata, so callers can
//! branch on the kind without parsing messages.

use thiserror::Error;

use crate::models::Anchor;

/// Convenience alias used throughout the pipeline.
pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RagError {
    /// The loader has no parser for the declared or sniffed format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Some content could not be parsed. `text` and `anchors` hold what
    /// was recovered.
    #[error("partial extraction: {reason}")]
    PartialExtraction {
        text: String,
        anchors: Vec<Anchor>,
        reason: String,
    },

    /// Transient embedding failures outlasted the retry policy.
    #[error("embedding service unavailable after {attempts} attempt(s): {message}")]
    EmbeddingUnavailable { attempts: u32, message: String },

    /// The embedding provider refused the request permanently.
    #[error("embedding request rejected: {0}")]
    EmbeddingRejected(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("no tool registered with name: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    /// An operation was aborted before it finished (deadline or caller).
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl RagError {
    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "UnsupportedFormat",
            RagError::PartialExtraction { .. } => "PartialExtraction",
            RagError::EmbeddingUnavailable { .. } => "EmbeddingUnavailable",
            RagError::EmbeddingRejected(_) => "EmbeddingRejected",
            RagError::RetrievalUnavailable(_) => "RetrievalUnavailable",
            RagError::UnknownTool(_) => "UnknownTool",
            RagError::InvalidArguments(_) => "InvalidArguments",
            RagError::StorageUnavailable(_) => "StorageUnavailable",
            RagError::DocumentNotFound(_) => "DocumentNotFound",
            RagError::DuplicateTool(_) => "DuplicateTool",
            RagError::Cancelled(_) => "Cancelled",
        }
    }

    /// Shorthand for building an [`RagError::InvalidArguments`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        RagError::InvalidArguments(msg.into())
    }

    /// Shorthand for building a [`RagError::StorageUnavailable`].
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        RagError::StorageUnavailable(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(RagError::UnknownTool("x".into()).kind(), "UnknownTool");
        assert_eq!(
            RagError::EmbeddingUnavailable {
                attempts: 3,
                message: "429".into()
            }
            .kind(),
            "EmbeddingUnavailable"
        );
        assert_eq!(RagError::invalid("topK").kind(), "InvalidArguments");
    }

    #[test]
    fn test_display_carries_detail() {
        let err = RagError::UnknownTool("nonexistent".into());
        assert_eq!(err.to_string(), "no tool registered with name: nonexistent");

        let err = RagError::PartialExtraction {
            text: "recovered".into(),
            anchors: Vec::new(),
            reason: "page 2 unreadable".into(),
        };
        assert_eq!(err.to_string(), "partial extraction: page 2 unreadable");
    }
}
