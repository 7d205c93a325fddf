//! Storage abstraction for knowledge bases.
//!
//! A [`KnowledgeStore`] holds one independent partition per knowledge
//! base name. Writes are additive: [`upsert`](KnowledgeStore::upsert)
//! only ever adds chunks, it never replaces or deletes them.
//!
//! Implementations must be `Send + Sync`. Concurrent writes to the same
//! knowledge base must be serialized by the implementation; reads and
//! writes to different knowledge bases never interfere.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Chunk;

/// A stored chunk together with its vector and its similarity to a query.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The stored chunk; `knowledge_base` is always set.
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Abstract per-knowledge-base vector storage.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`exists`](KnowledgeStore::exists) | Whether a store has been created for the name |
/// | [`upsert`](KnowledgeStore::upsert) | Append embedded chunks, creating the store if needed |
/// | [`nearest`](KnowledgeStore::nearest) | Top candidates by cosine similarity |
/// | [`count`](KnowledgeStore::count) | Number of stored chunks |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Returns `true` if a store exists for `knowledge_base`.
    async fn exists(&self, knowledge_base: &str) -> Result<bool>;

    /// Append `chunks` with their `vectors` (same length, same order).
    ///
    /// Each chunk is tagged with `knowledge_base` on the way in. Returns
    /// the number of chunks written.
    async fn upsert(
        &self,
        knowledge_base: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<usize>;

    /// The `limit` stored chunks most similar to `query_vec`, best first.
    ///
    /// A missing store yields an empty list, not an error.
    async fn nearest(
        &self,
        knowledge_base: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Number of chunks stored for `knowledge_base` (0 if missing).
    async fn count(&self, knowledge_base: &str) -> Result<usize>;
}

/// Sort candidates by score, best first, keeping insertion order on ties.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
