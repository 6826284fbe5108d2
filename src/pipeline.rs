//! Shared application state: the index plus the services built on it.
//!
//! One [`Pipeline`] is built per process (CLI command or server) and
//! shared behind an `Arc` by the tool gateway, HTTP handlers and the MCP
//! bridge.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use rag_harness_core::embedding::Embedder;
use rag_harness_core::store::VectorIndex;

use crate::config::Config;
use crate::embedding::{create_embedder, EmbeddingClient};
use crate::ingest::Ingestor;
use crate::retrieve::Retriever;
use crate::sqlite_store::SqliteIndex;

pub struct Pipeline {
    pub index: Arc<dyn VectorIndex>,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
}

impl Pipeline {
    /// Wire the services around an existing index and embedder.
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        let embeddings = EmbeddingClient::new(embedder, &config.embedding);
        Pipeline {
            ingestor: Ingestor::new(
                index.clone(),
                embeddings.clone(),
                config.chunking.params(),
                config.ingest.clone(),
            ),
            retriever: Retriever::new(index.clone(), embeddings, config.retrieval.clone()),
            index,
        }
    }

    /// Open the SQLite index and the configured embedding provider.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let index = SqliteIndex::open(config).await?;
        let embedder = create_embedder(&config.embedding)?;
        info!(
            db = %config.db.path.display(),
            provider = %config.embedding.provider,
            model = embedder.model(),
            "pipeline ready"
        );
        Ok(Self::new(Arc::new(index), embedder, config))
    }
}
