//! Ranking rules shared by every index backend and the retrieval service.
//!
//! # Ordering
//!
//! Results are sorted by score (descending), then by index insertion
//! sequence (ascending), so equal scores resolve to the chunk created
//! first and repeated queries over a fixed corpus return identical order.
//!
//! # Hybrid scoring
//!
//! 1. Fetch semantic candidates (cosine) and keyword candidates.
//! 2. Merge per chunk with a [`MergeStrategy`]:
//!    - `weighted_sum`: min-max normalize each set to `[0, 1]`, then
//!      `score = α × semantic + (1 - α) × keyword`
//!    - `max_score`: the larger of the two normalized scores
//!    - `rrf`: reciprocal rank fusion, `Σ 1 / (60 + rank)`, divided by its
//!      maximum so a chunk ranked first in both sets scores 1.0
//!
//!    A chunk missing from one set scores 0 there.
//! 3. Rank and truncate.
//!
//! # Finalization
//!
//! [`remove_near_duplicates`] and [`limit_per_document`] thin a ranked list
//! in place, keeping the higher-ranked copy.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{SearchFilter, SimilarityResult};

/// How the retrieval service scores chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    /// Whether this mode needs the query embedded.
    pub fn needs_embedding(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode: {}. Use semantic, keyword, or hybrid.",
                other
            )),
        }
    }
}

/// How hybrid search combines its two channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    WeightedSum,
    MaxScore,
    Rrf,
}

/// Rank offset for reciprocal rank fusion.
pub const RRF_K: f64 = 60.0;

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::WeightedSum => "weighted_sum",
            MergeStrategy::MaxScore => "max_score",
            MergeStrategy::Rrf => "rrf",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_sum" => Ok(MergeStrategy::WeightedSum),
            "max_score" => Ok(MergeStrategy::MaxScore),
            "rrf" => Ok(MergeStrategy::Rrf),
            other => Err(format!(
                "unknown merge strategy: {}. Use weighted_sum, max_score, or rrf.",
                other
            )),
        }
    }
}

/// Sort by score desc then creation order, and keep the first `top_k`.
pub fn rank(mut results: Vec<SimilarityResult>, top_k: usize) -> Vec<SimilarityResult> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));
    results.truncate(top_k);
    results
}

/// Client-side equivalent of filter pushdown.
pub fn apply_filter(
    results: Vec<SimilarityResult>,
    filter: &SearchFilter,
) -> Vec<SimilarityResult> {
    if filter.is_empty() {
        return results;
    }
    results
        .into_iter()
        .filter(|r| filter.admits(&r.document_id))
        .collect()
}

/// Lowercase, deduplicated alphanumeric terms of a query.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

/// Fraction of `terms` that occur as whole words in `text`.
pub fn keyword_score(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let matched = terms.iter().filter(|t| words.contains(t)).count();
    matched as f64 / terms.len() as f64
}

/// Min-max normalize scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[SimilarityResult]) -> Vec<(&SimilarityResult, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Per-chunk channel scores under `strategy`, keyed by chunk id.
fn channel_scores(
    candidates: &[SimilarityResult],
    strategy: MergeStrategy,
) -> HashMap<String, f64> {
    match strategy {
        MergeStrategy::Rrf => rank(candidates.to_vec(), candidates.len())
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c.chunk_id, 1.0 / (RRF_K + (i + 1) as f64)))
            .collect(),
        MergeStrategy::WeightedSum | MergeStrategy::MaxScore => normalize_scores(candidates)
            .into_iter()
            .map(|(c, s)| (c.chunk_id.clone(), s))
            .collect(),
    }
}

/// Merge semantic and keyword candidates into one ranked list.
///
/// `alpha` is the semantic weight and only applies to
/// [`MergeStrategy::WeightedSum`].
pub fn merge_hybrid(
    semantic: &[SimilarityResult],
    keyword: &[SimilarityResult],
    strategy: MergeStrategy,
    alpha: f64,
    top_k: usize,
) -> Vec<SimilarityResult> {
    let alpha = alpha.clamp(0.0, 1.0);
    let vec_map = channel_scores(semantic, strategy);
    let kw_map = channel_scores(keyword, strategy);
    let rrf_max = 2.0 / (RRF_K + 1.0);

    let mut merged: HashMap<&str, SimilarityResult> = HashMap::new();
    for c in semantic.iter().chain(keyword.iter()) {
        merged.entry(c.chunk_id.as_str()).or_insert_with(|| {
            let v = vec_map.get(&c.chunk_id).copied().unwrap_or(0.0);
            let k = kw_map.get(&c.chunk_id).copied().unwrap_or(0.0);
            let mut r = c.clone();
            r.score = match strategy {
                MergeStrategy::WeightedSum => alpha * v + (1.0 - alpha) * k,
                MergeStrategy::MaxScore => v.max(k),
                MergeStrategy::Rrf => ((v + k) / rrf_max).min(1.0),
            };
            r
        });
    }

    rank(merged.into_values().collect(), top_k)
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Jaccard similarity of the lowercase whitespace-separated words.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (wa, wb) = (word_set(a), word_set(b));
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    wa.intersection(&wb).count() as f64 / union as f64
}

/// Drop results whose text matches an earlier result exactly (after
/// trimming) or with [`text_similarity`] at or above `threshold`.
pub fn remove_near_duplicates(
    results: Vec<SimilarityResult>,
    threshold: f64,
) -> Vec<SimilarityResult> {
    let mut kept: Vec<SimilarityResult> = Vec::with_capacity(results.len());
    for r in results {
        let text = r.text.trim();
        let duplicate = kept.iter().any(|k| {
            let seen = k.text.trim();
            seen == text || (threshold < 1.0 && text_similarity(seen, text) >= threshold)
        });
        if !duplicate {
            kept.push(r);
        }
    }
    kept
}

/// Keep at most `max` results per document, in rank order.
pub fn limit_per_document(results: Vec<SimilarityResult>, max: usize) -> Vec<SimilarityResult> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    results
        .into_iter()
        .filter(|r| {
            let n = seen.entry(r.document_id.clone()).or_insert(0);
            *n += 1;
            *n <= max
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, doc_id: &str, score: f64, seq: i64) -> SimilarityResult {
        SimilarityResult {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            document_name: doc_id.to_string(),
            chunk_index: 0,
            text: String::new(),
            metadata: serde_json::json!({}),
            created_at: 0,
            score,
            context: None,
            seq,
        }
    }

    fn ids(results: &[SimilarityResult]) -> Vec<&str> {
        results.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let ranked = rank(
            vec![
                make_candidate("low", "d", 0.1, 0),
                make_candidate("high", "d", 0.9, 1),
                make_candidate("mid", "d", 0.5, 2),
            ],
            2,
        );
        assert_eq!(ids(&ranked), vec!["high", "mid"]);
    }

    #[test]
    fn test_rank_ties_by_sequence() {
        let ranked = rank(
            vec![
                make_candidate("later", "d", 0.5, 7),
                make_candidate("earlier", "d", 0.5, 3),
            ],
            10,
        );
        assert_eq!(ids(&ranked), vec!["earlier", "later"]);
    }

    #[test]
    fn test_apply_filter() {
        let results = vec![
            make_candidate("c1", "a", 1.0, 0),
            make_candidate("c2", "b", 1.0, 1),
        ];
        let only_b = SearchFilter::documents(vec!["b".into()]);
        let filtered = apply_filter(results.clone(), &only_b);
        assert_eq!(ids(&filtered), vec!["c2"]);
        assert_eq!(apply_filter(results, &SearchFilter::default()).len(), 2);
    }

    #[test]
    fn test_query_terms_and_keyword_score() {
        let terms = query_terms("Refund policy, refund!");
        assert_eq!(terms, vec!["refund".to_string(), "policy".to_string()]);
        assert!((keyword_score(&terms, "Our REFUND rules") - 0.5).abs() < 1e-9);
        assert!((keyword_score(&terms, "refund policy text") - 1.0).abs() < 1e-9);
        assert_eq!(keyword_score(&terms, "refunds"), 0.0);
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", "d1", 10.0, 0),
            make_candidate("c2", "d2", 5.0, 1),
            make_candidate("c3", "d3", 0.0, 2),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![
            make_candidate("c1", "d1", 3.0, 0),
            make_candidate("c2", "d2", 3.0, 1),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_hybrid_alpha_extremes() {
        let semantic = vec![
            make_candidate("c1", "d", 0.1, 0),
            make_candidate("c2", "d", 0.9, 1),
            make_candidate("c3", "d", 0.5, 2),
        ];
        let keyword = vec![
            make_candidate("c1", "d", 1.0, 0),
            make_candidate("c2", "d", 0.5, 1),
        ];

        let vector_only = merge_hybrid(&semantic, &keyword, MergeStrategy::WeightedSum, 1.0, 10);
        assert_eq!(ids(&vector_only), vec!["c2", "c3", "c1"]);

        let keyword_only = merge_hybrid(&semantic, &keyword, MergeStrategy::WeightedSum, 0.0, 10);
        assert_eq!(ids(&keyword_only)[..2], ["c1", "c2"]);
    }

    #[test]
    fn test_hybrid_scores_in_unit_range() {
        let semantic = vec![
            make_candidate("c1", "d", -0.4, 0),
            make_candidate("c2", "d", 0.8, 1),
        ];
        let keyword = vec![make_candidate("c3", "d", 0.3, 2)];
        for strategy in [
            MergeStrategy::WeightedSum,
            MergeStrategy::MaxScore,
            MergeStrategy::Rrf,
        ] {
            for r in merge_hybrid(&semantic, &keyword, strategy, 0.6, 10) {
                assert!((0.0..=1.0).contains(&r.score), "score out of range: {}", r.score);
            }
        }
    }

    #[test]
    fn test_max_score_takes_best_channel() {
        let semantic = vec![
            make_candidate("c1", "d", 0.9, 0),
            make_candidate("c2", "d", 0.1, 1),
        ];
        let keyword = vec![
            make_candidate("c2", "d", 0.8, 1),
            make_candidate("c3", "d", 0.2, 2),
        ];
        let merged = merge_hybrid(&semantic, &keyword, MergeStrategy::MaxScore, 0.6, 10);
        // c1 and c2 both reach 1.0 in one channel; c1 was created first.
        assert_eq!(ids(&merged), vec!["c1", "c2", "c3"]);
        assert_eq!(merged[0].score, 1.0);
        assert_eq!(merged[1].score, 1.0);
        assert_eq!(merged[2].score, 0.0);
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let semantic = vec![
            make_candidate("c1", "d", 0.9, 0),
            make_candidate("c2", "d", 0.8, 1),
            make_candidate("c3", "d", 0.7, 2),
        ];
        let keyword = vec![
            make_candidate("c2", "d", 0.9, 1),
            make_candidate("c4", "d", 0.5, 3),
        ];
        let merged = merge_hybrid(&semantic, &keyword, MergeStrategy::Rrf, 0.6, 10);
        assert_eq!(ids(&merged), vec!["c2", "c1", "c4", "c3"]);

        let expected = (1.0 / 62.0 + 1.0 / 61.0) / (2.0 / 61.0);
        assert!((merged[0].score - expected).abs() < 1e-9);

        let both_first = merge_hybrid(&semantic[..1], &semantic[..1], MergeStrategy::Rrf, 0.6, 1);
        assert!((both_first[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_text_similarity() {
        assert_eq!(text_similarity("same text", "same text"), 1.0);
        assert!((text_similarity("a b c d", "a b c e") - 0.6).abs() < 1e-9);
        assert_eq!(text_similarity("Refund Policy", "refund policy"), 1.0);
        assert_eq!(text_similarity("", "   "), 0.0);
    }

    #[test]
    fn test_remove_near_duplicates_keeps_first() {
        let mut a = make_candidate("c1", "d1", 0.9, 0);
        a.text = "refunds within thirty days of delivery".into();
        let mut b = make_candidate("c2", "d2", 0.8, 1);
        b.text = "  refunds within thirty days of delivery ".into();
        let mut c = make_candidate("c3", "d3", 0.7, 2);
        c.text = "refunds within thirty days of purchase".into();
        let mut d = make_candidate("c4", "d4", 0.6, 3);
        d.text = "gift cards are final sale".into();
        let all = vec![a, b, c, d];

        let exact_only = remove_near_duplicates(all.clone(), 1.0);
        assert_eq!(ids(&exact_only), vec!["c1", "c3", "c4"]);

        let near = remove_near_duplicates(all, 0.7);
        assert_eq!(ids(&near), vec!["c1", "c4"]);
    }

    #[test]
    fn test_limit_per_document() {
        let results = vec![
            make_candidate("a1", "a", 0.9, 0),
            make_candidate("a2", "a", 0.8, 1),
            make_candidate("b1", "b", 0.7, 2),
            make_candidate("a3", "a", 0.6, 3),
            make_candidate("b2", "b", 0.5, 4),
        ];
        let limited = limit_per_document(results, 1);
        assert_eq!(ids(&limited), vec!["a1", "b1"]);
    }

    #[test]
    fn test_merge_strategy_parse() {
        assert_eq!("rrf".parse::<MergeStrategy>(), Ok(MergeStrategy::Rrf));
        assert_eq!(MergeStrategy::default().as_str(), "weighted_sum");
        assert!("average".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>(), Ok(SearchMode::Hybrid));
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert!(!SearchMode::Keyword.needs_embedding());
    }
}
