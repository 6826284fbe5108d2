//! Retrieval service: query text in, ranked [`SimilarityResult`]s out.
//!
//! | Mode | Channels |
//! |------|----------|
//! | `semantic` | embed query → cosine similarity search |
//! | `keyword` | keyword search only, no embedding call |
//! | `hybrid` | both, merged with the configured [`MergeStrategy`] |
//!
//! Document filters are pushed down to the index when it supports that;
//! otherwise the full candidate set is fetched and filtered here before
//! truncation.
//!
//! Ranked results then pass through `min_score`, near-duplicate removal
//! and the per-document cap, in that order, before the final `top_k`
//! truncation. The whole result set is built before it is returned.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use rag_harness_core::models::{ChunkContext, SearchFilter, SimilarityResult};
use rag_harness_core::search::{
    apply_filter, limit_per_document, merge_hybrid, rank, remove_near_duplicates, MergeStrategy,
    SearchMode,
};
use rag_harness_core::store::VectorIndex;
use rag_harness_core::{RagError, Result};

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;

/// Fetch size meaning "everything the index has".
const UNBOUNDED: usize = i64::MAX as usize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalQuery {
    pub text: String,
    /// Defaults to `retrieval.default_top_k`.
    pub top_k: Option<usize>,
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub mode: SearchMode,
    /// Overrides `retrieval.min_score`.
    pub min_score: Option<f64>,
    #[serde(default)]
    pub with_context: bool,
    /// Keep at most this many results per document.
    pub max_per_document: Option<usize>,
    /// Drop near-duplicate texts (`retrieval.dedupe_threshold`).
    #[serde(default)]
    pub dedupe: bool,
    /// Overrides `retrieval.merge_strategy`; hybrid mode only.
    pub merge_strategy: Option<MergeStrategy>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        RetrievalQuery {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }
}

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embeddings: EmbeddingClient,
    settings: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: EmbeddingClient,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Run a query.
    ///
    /// # Errors
    ///
    /// - `InvalidArguments` for empty text or `top_k` outside `1..=max_top_k`.
    /// - `RetrievalUnavailable` when the query cannot be embedded.
    /// - `StorageUnavailable` from the index.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<SimilarityResult>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RagError::invalid("query must not be empty"));
        }
        let top_k = query.top_k.unwrap_or(self.settings.default_top_k);
        if top_k == 0 || top_k > self.settings.max_top_k {
            return Err(RagError::invalid(format!(
                "topK must be between 1 and {}",
                self.settings.max_top_k
            )));
        }

        let filter = query
            .document_ids
            .clone()
            .map(SearchFilter::documents)
            .unwrap_or_default();
        let pushdown = filter.is_empty() || self.index.supports_filter_pushdown();
        let index_filter = if pushdown {
            filter.clone()
        } else {
            SearchFilter::default()
        };

        if query.max_per_document == Some(0) {
            return Err(RagError::invalid("maxPerDocument must be at least 1"));
        }
        // Finalization can discard ranked results, so fetch a wider pool.
        let finalizing = query.dedupe || query.max_per_document.is_some();
        let fetch_k = if finalizing {
            self.settings.candidate_k.max(top_k)
        } else {
            top_k
        };
        let strategy = query.merge_strategy.unwrap_or(self.settings.merge_strategy);

        let channel_k = |k: usize| if pushdown { k } else { UNBOUNDED };

        let mut results = match query.mode {
            SearchMode::Semantic => {
                let vector = self.embed_query(text).await?;
                self.index
                    .similarity_search(&vector, channel_k(fetch_k), &index_filter)
                    .await?
            }
            SearchMode::Keyword => {
                self.index
                    .keyword_search(text, channel_k(fetch_k), &index_filter)
                    .await?
            }
            SearchMode::Hybrid => {
                let candidates = channel_k(self.settings.candidate_k.max(fetch_k));
                let vector = self.embed_query(text).await?;
                let semantic = self
                    .index
                    .similarity_search(&vector, candidates, &index_filter)
                    .await?;
                let keyword = self
                    .index
                    .keyword_search(text, candidates, &index_filter)
                    .await?;
                let semantic = apply_filter(semantic, &filter);
                let keyword = apply_filter(keyword, &filter);
                merge_hybrid(
                    &semantic,
                    &keyword,
                    strategy,
                    self.settings.hybrid_alpha,
                    fetch_k,
                )
            }
        };

        if !pushdown {
            results = rank(apply_filter(results, &filter), fetch_k);
        }

        if let Some(min) = query.min_score.or(self.settings.min_score) {
            results.retain(|r| r.score >= min);
        }
        if query.dedupe {
            results = remove_near_duplicates(results, self.settings.dedupe_threshold);
        }
        if let Some(max) = query.max_per_document {
            results = limit_per_document(results, max);
        }
        results.truncate(top_k);

        if query.with_context {
            for result in &mut results {
                result.context = Some(self.context_for(result).await?);
            }
        }

        debug!(
            mode = %query.mode,
            merge = %strategy,
            top_k,
            results = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embeddings.embed_query(text).await.map_err(|e| match e {
            RagError::EmbeddingUnavailable { .. } | RagError::EmbeddingRejected(_) => {
                RagError::RetrievalUnavailable(format!("query embedding failed: {}", e))
            }
            other => other,
        })
    }

    /// Texts of the chunks directly before and after `result`.
    async fn context_for(&self, result: &SimilarityResult) -> Result<ChunkContext> {
        let idx = result.chunk_index;
        let neighbours = self
            .index
            .get_chunks(&result.document_id, (idx - 1).max(0)..=idx + 1)
            .await?;

        let mut context = ChunkContext::default();
        for chunk in neighbours {
            if chunk.chunk_index == idx - 1 {
                context.before = Some(chunk.text);
            } else if chunk.chunk_index == idx + 1 {
                context.after = Some(chunk.text);
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::DisabledEmbedder;
    use rag_harness_core::chunk::{make_chunk, TextSpan};
    use rag_harness_core::embedding::HashingEmbedder;
    use rag_harness_core::models::{Document, DocumentStatus, SourceFormat};
    use rag_harness_core::store::memory::InMemoryIndex;

    const DIMS: usize = 256;

    async fn seed(index: &InMemoryIndex, name: &str, texts: &[&str]) -> String {
        let embedder = HashingEmbedder::new(DIMS);
        let doc = Document::new(name, SourceFormat::Text, 0);
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
        doc.id
    }

    fn retriever(index: Arc<InMemoryIndex>) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::new(DIMS));
        Retriever::new(
            index,
            EmbeddingClient::new(embedder, &EmbeddingConfig::default()),
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_semantic_ranks_matching_chunk_first() {
        let index = Arc::new(InMemoryIndex::new());
        seed(
            &index,
            "faq",
            &[
                "Shipping takes five business days.",
                "Our refund policy allows returns within 30 days.",
                "Support is available on weekdays.",
            ],
        )
        .await;

        let results = retriever(index)
            .retrieve(&RetrievalQuery::new("refund policy").top_k(3))
            .await
            .unwrap();
        assert!(results.len() <= 3);
        assert!(results[0].text.contains("refund policy"));
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_top_k_bounds() {
        let index = Arc::new(InMemoryIndex::new());
        let r = retriever(index);
        for k in [0, 101] {
            let err = r
                .retrieve(&RetrievalQuery::new("x").top_k(k))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "InvalidArguments");
        }
        let err = r.retrieve(&RetrievalQuery::new("   ")).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArguments");
    }

    #[tokio::test]
    async fn test_client_side_filter_matches_pushdown() {
        let pushed = Arc::new(InMemoryIndex::new());
        let local = Arc::new(InMemoryIndex::without_filter_pushdown());
        let texts = ["alpha beta", "alpha gamma", "delta alpha"];
        let mut keep = Vec::new();
        for (i, t) in texts.iter().enumerate() {
            let a = seed(&pushed, &format!("d{i}"), &[t]).await;
            let b = seed(&local, &format!("d{i}"), &[t]).await;
            if i != 1 {
                keep.push((a, b));
            }
        }

        let mut q = RetrievalQuery::new("alpha").top_k(1);
        q.document_ids = Some(keep.iter().map(|(a, _)| a.clone()).collect());
        let via_pushdown = retriever(pushed).retrieve(&q).await.unwrap();
        q.document_ids = Some(keep.iter().map(|(_, b)| b.clone()).collect());
        let via_client = retriever(local).retrieve(&q).await.unwrap();

        assert_eq!(via_pushdown.len(), 1);
        assert_eq!(via_client.len(), 1);
        assert_eq!(via_pushdown[0].text, via_client[0].text);
        assert_ne!(via_client[0].text, "alpha gamma");
    }

    #[tokio::test]
    async fn test_keyword_mode_needs_no_embedder() {
        let index = Arc::new(InMemoryIndex::new());
        seed(&index, "doc", &["refund window", "shipping times"]).await;
        let r = Retriever::new(
            index,
            EmbeddingClient::new(Arc::new(DisabledEmbedder), &EmbeddingConfig::default()),
            RetrievalConfig::default(),
        );

        let results = r
            .retrieve(&RetrievalQuery::new("refund").mode(SearchMode::Keyword))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "refund window");

        let err = r.retrieve(&RetrievalQuery::new("refund")).await.unwrap_err();
        assert_eq!(err.kind(), "RetrievalUnavailable");
    }

    #[tokio::test]
    async fn test_min_score_and_context() {
        let index = Arc::new(InMemoryIndex::new());
        seed(&index, "doc", &["intro words", "refund policy details", "closing words"]).await;

        let mut q = RetrievalQuery::new("refund policy").top_k(3);
        q.min_score = Some(0.5);
        q.with_context = true;
        let results = retriever(index).retrieve(&q).await.unwrap();

        assert_eq!(results.len(), 1);
        let ctx = results[0].context.as_ref().unwrap();
        assert_eq!(ctx.before.as_deref(), Some("intro words"));
        assert_eq!(ctx.after.as_deref(), Some("closing words"));
    }

    #[tokio::test]
    async fn test_hybrid_scores_in_unit_range() {
        let index = Arc::new(InMemoryIndex::new());
        seed(&index, "doc", &["refund policy", "refund", "unrelated text"]).await;
        let results = retriever(index)
            .retrieve(&RetrievalQuery::new("refund policy").mode(SearchMode::Hybrid))
            .await
            .unwrap();
        assert_eq!(results[0].text, "refund policy");
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn test_dedupe_and_per_document_cap() {
        let index = Arc::new(InMemoryIndex::new());
        let a = seed(
            &index,
            "a",
            &[
                "refund policy for orders",
                "refund policy for orders",
                "refund policy and exchanges",
            ],
        )
        .await;
        let b = seed(&index, "b", &["refund policy for gift cards"]).await;

        let plain = retriever(index.clone())
            .retrieve(&RetrievalQuery::new("refund policy").top_k(4))
            .await
            .unwrap();
        assert_eq!(plain.len(), 4);

        let mut q = RetrievalQuery::new("refund policy").top_k(4);
        q.dedupe = true;
        let deduped = retriever(index.clone()).retrieve(&q).await.unwrap();
        assert_eq!(deduped.len(), 3);
        let texts: Vec<_> = deduped.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts.iter().filter(|t| **t == "refund policy for orders").count(),
            1
        );

        let mut q = RetrievalQuery::new("refund policy").top_k(4);
        q.max_per_document = Some(1);
        let capped = retriever(index.clone()).retrieve(&q).await.unwrap();
        assert_eq!(capped.len(), 2);
        let mut docs: Vec<_> = capped.iter().map(|r| r.document_id.clone()).collect();
        docs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(docs, expected);

        q.max_per_document = Some(0);
        let err = retriever(index).retrieve(&q).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArguments");
    }

    #[tokio::test]
    async fn test_per_document_cap_still_fills_top_k() {
        let index = Arc::new(InMemoryIndex::new());
        seed(&index, "a", &["refund policy", "refund policy text", "refund policy more"]).await;
        seed(&index, "b", &["shipping refund"]).await;
        seed(&index, "c", &["refund desk hours"]).await;

        let mut q = RetrievalQuery::new("refund policy").top_k(3);
        q.max_per_document = Some(1);
        let results = retriever(index).retrieve(&q).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_hybrid_merge_strategies() {
        let index = Arc::new(InMemoryIndex::new());
        seed(&index, "doc", &["refund policy", "refund", "unrelated text"]).await;
        let r = retriever(index);

        for strategy in [MergeStrategy::WeightedSum, MergeStrategy::MaxScore, MergeStrategy::Rrf] {
            let mut q = RetrievalQuery::new("refund policy").mode(SearchMode::Hybrid);
            q.merge_strategy = Some(strategy);
            let results = r.retrieve(&q).await.unwrap();
            assert_eq!(results[0].text, "refund policy", "{}", strategy);
            assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        }
    }
}
