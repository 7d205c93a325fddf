//! SQLite-backed [`KnowledgeStore`].
//!
//! Each knowledge base gets its own database file at
//! `<store_root>/<kb>/store.sqlite`, so knowledge bases never share a
//! writer. Within one knowledge base, [`upsert`](KnowledgeStore::upsert)
//! holds a per-name async mutex for the whole write transaction; queries
//! never take it.
//!
//! Vector search is brute-force cosine similarity over every stored vector
//! of the knowledge base.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use kb_assist_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use kb_assist_core::models::Chunk;
use kb_assist_core::store::{sort_candidates, Candidate, KnowledgeStore};

use crate::db;
use crate::layout::{validate_kb_name, KbLayout};
use crate::migrate;

pub struct SqliteStore {
    layout: KbLayout,
    pools: Mutex<HashMap<String, SqlitePool>>,
    writers: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqliteStore {
    pub fn new(layout: KbLayout) -> Self {
        Self {
            layout,
            pools: Mutex::new(HashMap::new()),
            writers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Cached pool for `kb`, opening (and creating, if `create`) on first use.
    async fn pool(&self, kb: &str, create: bool) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(kb) {
            return Ok(pool.clone());
        }
        let pool = db::connect(&self.layout.store_file(kb), create).await?;
        migrate::run_migrations(&pool).await?;
        pools.insert(kb.to_string(), pool.clone());
        Ok(pool)
    }

    fn writer_lock(&self, kb: &str) -> Result<Arc<Mutex<()>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| anyhow::anyhow!("writer table lock poisoned"))?;
        Ok(Arc::clone(
            writers
                .entry(kb.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Close every open pool. Pending writes are already committed.
    pub async fn close(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn exists(&self, knowledge_base: &str) -> Result<bool> {
        validate_kb_name(knowledge_base)?;
        Ok(self.layout.store_file(knowledge_base).is_file())
    }

    async fn upsert(
        &self,
        knowledge_base: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<usize> {
        validate_kb_name(knowledge_base)?;
        if chunks.len() != vectors.len() {
            bail!(
                "{} chunks but {} vectors for knowledge base '{}'",
                chunks.len(),
                vectors.len(),
                knowledge_base
            );
        }

        let lock = self.writer_lock(knowledge_base)?;
        let _guard = lock.lock().await;

        let pool = self.pool(knowledge_base, true).await?;
        let now = chrono::Utc::now().timestamp();
        let mut tx = pool.begin().await?;

        for (chunk, vector) in chunks.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, knowledge_base, source, start_offset, content, hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(knowledge_base)
            .bind(&chunk.source)
            .bind(chunk.start_offset as i64)
            .bind(&chunk.content)
            .bind(&chunk.hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, model, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(kb = %knowledge_base, chunks = chunks.len(), model, "stored chunks");
        Ok(chunks.len())
    }

    async fn nearest(
        &self,
        knowledge_base: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if !self.exists(knowledge_base).await? {
            debug!(kb = %knowledge_base, "no store on disk");
            return Ok(Vec::new());
        }

        let pool = self.pool(knowledge_base, false).await?;
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source, c.start_offset, c.content, c.hash, v.embedding
            FROM chunks c
            JOIN chunk_vectors v ON v.chunk_id = c.id
            ORDER BY c.rowid
            "#,
        )
        .fetch_all(&pool)
        .await?;

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .map(|row| {
                let vector = blob_to_vec(&row.get::<Vec<u8>, _>("embedding"));
                let score = cosine_similarity(query_vec, &vector);
                Candidate {
                    chunk: Chunk {
                        id: row.get("id"),
                        content: row.get("content"),
                        source: row.get("source"),
                        start_offset: row.get::<i64, _>("start_offset") as usize,
                        knowledge_base: Some(knowledge_base.to_string()),
                        hash: row.get("hash"),
                    },
                    vector,
                    score,
                }
            })
            .collect();

        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count(&self, knowledge_base: &str) -> Result<usize> {
        if !self.exists(knowledge_base).await? {
            return Ok(0);
        }
        let pool = self.pool(knowledge_base, false).await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await?;
        Ok(n as usize)
    }
}
