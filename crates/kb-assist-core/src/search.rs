//! Ranking algorithms for knowledge-base retrieval.
//!
//! Everything here operates on a [`KnowledgeStore`] and precomputed query
//! vectors; the calling application embeds queries and picks parameters.
//!
//! # Per-knowledge-base query
//!
//! - [`SearchStrategy::Similarity`]: plain top-`k` by cosine similarity.
//! - [`SearchStrategy::Mmr`]: fetch `fetch_k` candidates, then greedily
//!   pick `k` maximising `λ·sim(q, d) − (1 − λ)·max sim(d, picked)`.
//!
//! # Cross-knowledge-base merge
//!
//! 1. Concatenate per-knowledge-base results in selection order.
//! 2. Drop results below the relevance threshold, if one is set.
//! 3. Stable sort by score, descending; missing scores rank last.
//! 4. Truncate to the final limit.

use anyhow::Result;

use crate::embedding::cosine_similarity;
use crate::models::RetrievalResult;
use crate::store::{Candidate, KnowledgeStore};

/// How a single knowledge base is queried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchStrategy {
    Similarity,
    /// Maximal marginal relevance; `lambda` of 1.0 is pure relevance.
    Mmr { lambda: f32 },
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub strategy: SearchStrategy,
    /// Results per knowledge base.
    pub k: usize,
    /// Candidate pool for MMR; ignored by plain similarity.
    pub fetch_k: usize,
}

/// Query one knowledge base and tag every hit with its name.
///
/// A knowledge base without a store yields no results.
pub async fn search_knowledge_base<S: KnowledgeStore + ?Sized>(
    store: &S,
    knowledge_base: &str,
    query_vec: &[f32],
    params: &SearchParams,
) -> Result<Vec<RetrievalResult>> {
    let selected = match params.strategy {
        SearchStrategy::Similarity => store.nearest(knowledge_base, query_vec, params.k).await?,
        SearchStrategy::Mmr { lambda } => {
            let pool = store
                .nearest(knowledge_base, query_vec, params.fetch_k.max(params.k))
                .await?;
            select_mmr(pool, params.k, lambda)
        }
    };

    Ok(selected
        .into_iter()
        .map(|c| RetrievalResult {
            content: c.chunk.content,
            source: c.chunk.source,
            knowledge_base: knowledge_base.to_string(),
            relevance_score: Some(c.score),
        })
        .collect())
}

/// Greedy maximal-marginal-relevance selection.
///
/// `candidates[i].score` must already hold the similarity to the query.
/// Returned candidates are in pick order.
pub fn select_mmr(candidates: Vec<Candidate>, k: usize, lambda: f32) -> Vec<Candidate> {
    let mut remaining = candidates;
    let mut picked: Vec<Candidate> = Vec::with_capacity(k.min(remaining.len()));

    while picked.len() < k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (idx, cand) in remaining.iter().enumerate() {
            let redundancy = picked
                .iter()
                .map(|p| cosine_similarity(&cand.vector, &p.vector))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if picked.is_empty() { 0.0 } else { redundancy };
            let value = lambda * cand.score - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_idx = idx;
            }
        }
        picked.push(remaining.remove(best_idx));
    }

    picked
}

/// Keep only results scoring at or above `threshold`.
///
/// Results without a score cannot demonstrate relevance and are dropped.
pub fn filter_by_threshold(results: Vec<RetrievalResult>, threshold: f32) -> Vec<RetrievalResult> {
    results
        .into_iter()
        .filter(|r| r.relevance_score.is_some_and(|s| s >= threshold))
        .collect()
}

/// Merge per-knowledge-base results and keep the best `limit`.
///
/// The sort is stable, so equal scores keep selection order and the final
/// order does not depend on which knowledge base was fetched first.
pub fn merge_ranked(per_kb: Vec<Vec<RetrievalResult>>, limit: usize) -> Vec<RetrievalResult> {
    let mut all: Vec<RetrievalResult> = per_kb.into_iter().flatten().collect();
    all.sort_by(|a, b| {
        let a = a.relevance_score.unwrap_or(f32::NEG_INFINITY);
        let b = b.relevance_score.unwrap_or(f32::NEG_INFINITY);
        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
    });
    all.truncate(limit);
    all
}

/// Join result contents with `separator`.
pub fn format_context(results: &[RetrievalResult], separator: &str) -> String {
    results
        .iter()
        .map(|r| r.content.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

/// One citation per result, same order as the context.
pub fn format_sources(results: &[RetrievalResult]) -> Vec<String> {
    results.iter().map(RetrievalResult::citation).collect()
}
