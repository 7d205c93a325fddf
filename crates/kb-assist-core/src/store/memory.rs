//! In-memory [`KnowledgeStore`] for tests and ephemeral sessions.
//!
//! Uses a `HashMap` of knowledge bases behind `std::sync::RwLock`.
//! Vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Chunk;

use super::{sort_candidates, Candidate, KnowledgeStore};

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// In-memory store, one `Vec` of chunks per knowledge base.
#[derive(Default)]
pub struct InMemoryStore {
    bases: RwLock<HashMap<String, Vec<StoredChunk>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn exists(&self, knowledge_base: &str) -> Result<bool> {
        let bases = self.bases.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(bases.contains_key(knowledge_base))
    }

    async fn upsert(
        &self,
        knowledge_base: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        _model: &str,
    ) -> Result<usize> {
        if chunks.len() != vectors.len() {
            bail!(
                "{} chunks but {} vectors for knowledge base '{}'",
                chunks.len(),
                vectors.len(),
                knowledge_base
            );
        }
        // The write lock doubles as the single-writer guard.
        let mut bases = self
            .bases
            .write()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let stored = bases.entry(knowledge_base.to_string()).or_default();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            stored.push(StoredChunk {
                chunk: chunk.clone().in_knowledge_base(knowledge_base),
                vector: vector.clone(),
            });
        }
        Ok(chunks.len())
    }

    async fn nearest(
        &self,
        knowledge_base: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let bases = self.bases.read().map_err(|_| anyhow!("store lock poisoned"))?;
        let Some(stored) = bases.get(knowledge_base) else {
            return Ok(Vec::new());
        };
        let mut candidates: Vec<Candidate> = stored
            .iter()
            .map(|sc| Candidate {
                chunk: sc.chunk.clone(),
                vector: sc.vector.clone(),
                score: cosine_similarity(query_vec, &sc.vector),
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count(&self, knowledge_base: &str) -> Result<usize> {
        let bases = self.bases.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(bases.get(knowledge_base).map_or(0, Vec::len))
    }
}
