//! Context retriever: query every selected knowledge base and assemble a
//! bounded context string with citations.
//!
//! When nothing survives (empty selection, no built stores, nothing above
//! the threshold, everything compressed away) the result is
//! `context = None, sources = []` and the query reaches the agent without
//! a context block.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, warn};

use kb_assist_core::embedding::{embed_query, EmbeddingProvider};
use kb_assist_core::models::{Message, RetrievalResult};
use kb_assist_core::search::{
    filter_by_threshold, format_context, format_sources, merge_ranked, search_knowledge_base,
    SearchParams,
};
use kb_assist_core::store::KnowledgeStore;

use crate::config::Config;
use crate::llm::{complete, ChatModel};

/// Output of [`ContextRetriever::retrieve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub context: Option<String>,
    /// `"<source> (KB: <kb>)"`, same order as the context.
    pub sources: Vec<String>,
    pub results: Vec<RetrievalResult>,
}

impl RetrievedContext {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Reduces a retrieved passage to the part relevant to a query.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// `None` when nothing in `passage` is relevant.
    async fn extract(&self, query: &str, passage: &str) -> Result<Option<String>>;
}

const NO_OUTPUT: &str = "NO_OUTPUT";

/// [`Compressor`] backed by a chat model.
pub struct LlmCompressor {
    model: Arc<dyn ChatModel>,
}

impl LlmCompressor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

fn extraction_prompt(query: &str, passage: &str) -> String {
    format!(
        "Given the following question and context, extract any part of the context \
         *AS IS* that is relevant to answer the question. If none of the context is \
         relevant return {NO_OUTPUT}.\n\n\
         Remember, *DO NOT* edit the extracted parts of the context.\n\n\
         > Question: {query}\n> Context:\n>>>\n{passage}\n>>>\nExtracted relevant parts:"
    )
}

#[async_trait]
impl Compressor for LlmCompressor {
    async fn extract(&self, query: &str, passage: &str) -> Result<Option<String>> {
        let reply = complete(
            self.model.as_ref(),
            &[Message::user(extraction_prompt(query, passage))],
        )
        .await?;
        let reply = reply.trim();
        if reply.is_empty() || reply == NO_OUTPUT {
            Ok(None)
        } else {
            Ok(Some(reply.to_string()))
        }
    }
}

pub struct ContextRetriever {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: SearchParams,
    final_limit: usize,
    threshold: Option<f32>,
    separator: String,
    compressor: Option<Arc<dyn Compressor>>,
}

impl ContextRetriever {
    pub fn new(
        config: &Config,
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            embedder,
            params: config.search_params(),
            final_limit: config.retrieval.final_limit,
            threshold: config.retrieval.relevance_threshold,
            separator: config.retrieval.separator.clone(),
            compressor: None,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Retrieve context for `query` from `selected` knowledge bases.
    ///
    /// Missing stores are skipped with a warning. The query is embedded at
    /// most once, and not at all when no selected store exists. Embedding,
    /// store and compression failures are returned as errors.
    pub async fn retrieve(&self, query: &str, selected: &[String]) -> Result<RetrievedContext> {
        if selected.is_empty() {
            return Ok(RetrievedContext::empty());
        }

        let mut present = Vec::with_capacity(selected.len());
        for kb in selected {
            if self.store.exists(kb).await? {
                present.push(kb.as_str());
            } else {
                warn!(kb = %kb, "knowledge base has no store; skipping");
            }
        }
        if present.is_empty() {
            return Ok(RetrievedContext::empty());
        }

        let query_vec = embed_query(self.embedder.as_ref(), query).await?;

        // Fetch concurrently; the merge below is independent of fetch order.
        let per_kb = try_join_all(present.iter().map(|kb| {
            search_knowledge_base(self.store.as_ref(), kb, &query_vec, &self.params)
        }))
        .await?;

        let mut candidates: Vec<RetrievalResult> = per_kb.into_iter().flatten().collect();
        if let Some(compressor) = &self.compressor {
            candidates = self.compress(compressor.as_ref(), query, candidates).await?;
        }
        if let Some(threshold) = self.threshold {
            candidates = filter_by_threshold(candidates, threshold);
        }

        let results = merge_ranked(vec![candidates], self.final_limit);
        if results.is_empty() {
            debug!(kbs = present.len(), "no results survived filtering");
            return Ok(RetrievedContext::empty());
        }

        debug!(results = results.len(), "retrieved context");
        Ok(RetrievedContext {
            context: Some(format_context(&results, &self.separator)),
            sources: format_sources(&results),
            results,
        })
    }

    async fn compress(
        &self,
        compressor: &dyn Compressor,
        query: &str,
        candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>> {
        let extracts = try_join_all(
            candidates
                .iter()
                .map(|c| compressor.extract(query, &c.content)),
        )
        .await?;
        Ok(candidates
            .into_iter()
            .zip(extracts)
            .filter_map(|(mut result, extract)| {
                extract.map(|text| {
                    result.content = text;
                    result
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_assist_core::models::Chunk;
    use kb_assist_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds everything to the same direction and counts calls.
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Keeps passages mentioning "keep".
    struct KeywordCompressor;

    #[async_trait]
    impl Compressor for KeywordCompressor {
        async fn extract(&self, _query: &str, passage: &str) -> Result<Option<String>> {
            Ok(passage.contains("keep").then(|| passage.to_uppercase()))
        }
    }

    fn chunk(text: &str, source: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", source, text),
            content: text.to_string(),
            source: source.to_string(),
            start_offset: 0,
            knowledge_base: None,
            hash: String::new(),
        }
    }

    /// Vector at `angle` radians from the query direction `[1, 0]`.
    fn at(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    async fn seeded() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert("a", &[chunk("low", "a.txt")], &[at(1.2)], "m")
            .await
            .unwrap();
        store
            .upsert("b", &[chunk("high keep", "b.txt")], &[at(0.1)], "m")
            .await
            .unwrap();
        store
            .upsert("c", &[chunk("mid keep", "c.txt")], &[at(0.6)], "m")
            .await
            .unwrap();
        store
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_selection_never_embeds() {
        let embedder = Arc::new(CountingEmbedder::default());
        let retriever = ContextRetriever::new(
            &Config::default(),
            Arc::new(InMemoryStore::new()),
            embedder.clone(),
        );
        let out = retriever.retrieve("anything", &[]).await.unwrap();
        assert_eq!(out, RetrievedContext::empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_store_skipped_without_embedding() {
        let embedder = Arc::new(CountingEmbedder::default());
        let retriever = ContextRetriever::new(
            &Config::default(),
            Arc::new(InMemoryStore::new()),
            embedder.clone(),
        );
        let out = retriever
            .retrieve("hello", &names(&["nonexistent_kb"]))
            .await
            .unwrap();
        assert!(out.context.is_none());
        assert!(out.sources.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_merge_ranks_across_kbs_regardless_of_selection_order() {
        let store = seeded().await;
        let embedder = Arc::new(CountingEmbedder::default());
        let retriever = ContextRetriever::new(&Config::default(), store, embedder.clone());

        for order in [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]] {
            let out = retriever.retrieve("q", &names(&order)).await.unwrap();
            assert_eq!(out.context.as_deref(), Some("high keep\n\nmid keep\n\nlow"));
            assert_eq!(
                out.sources,
                vec!["b.txt (KB: b)", "c.txt (KB: c)", "a.txt (KB: a)"]
            );
        }
        // One embedding per retrieve call.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_threshold_empties_to_none() {
        let store = seeded().await;
        let mut config = Config::default();
        config.retrieval.relevance_threshold = Some(0.999);
        let retriever = ContextRetriever::new(&config, store, Arc::new(CountingEmbedder::default()));
        let out = retriever.retrieve("q", &names(&["a", "c"])).await.unwrap();
        assert_eq!(out, RetrievedContext::empty());
    }

    #[tokio::test]
    async fn test_threshold_keeps_relevant() {
        let store = seeded().await;
        let mut config = Config::default();
        config.retrieval.relevance_threshold = Some(0.7);
        let retriever = ContextRetriever::new(&config, store, Arc::new(CountingEmbedder::default()));
        let out = retriever.retrieve("q", &names(&["a", "b", "c"])).await.unwrap();
        // cos(0.1) ≈ 0.995, cos(0.6) ≈ 0.825, cos(1.2) ≈ 0.362
        assert_eq!(out.results.len(), 2);
    }

    #[tokio::test]
    async fn test_final_limit() {
        let store = seeded().await;
        let mut config = Config::default();
        config.retrieval.final_limit = 1;
        let retriever = ContextRetriever::new(&config, store, Arc::new(CountingEmbedder::default()));
        let out = retriever.retrieve("q", &names(&["a", "b", "c"])).await.unwrap();
        assert_eq!(out.sources, vec!["b.txt (KB: b)"]);
    }

    #[tokio::test]
    async fn test_compression_drops_and_rewrites() {
        let store = seeded().await;
        let retriever = ContextRetriever::new(
            &Config::default(),
            store,
            Arc::new(CountingEmbedder::default()),
        )
        .with_compressor(Arc::new(KeywordCompressor));
        let out = retriever.retrieve("q", &names(&["a", "b", "c"])).await.unwrap();
        assert_eq!(out.context.as_deref(), Some("HIGH KEEP\n\nMID KEEP"));
    }

    #[test]
    fn test_extraction_prompt_mentions_sentinel() {
        let prompt = extraction_prompt("capital?", "Paris.");
        assert!(prompt.contains("NO_OUTPUT"));
        assert!(prompt.contains("Paris."));
    }
}
