//! End-to-end tests of the knowledge-base pipeline against the SQLite store.
//!
//! Embeddings come from a deterministic bag-of-words provider so ranking is
//! predictable without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kb_assist::app::App;
use kb_assist::commands::{CommandError, CommandMatcher, CommandResult, ScreenCapture};
use kb_assist::config::Config;
use kb_assist::layout::KbLayout;
use kb_assist::sqlite_store::SqliteStore;
use kb_assist_core::embedding::EmbeddingProvider;
use kb_assist_core::models::Content;
use kb_assist_core::store::KnowledgeStore;
use tempfile::TempDir;

const DIMS: usize = 64;

/// Hashes lower-cased words into a fixed number of buckets.
#[derive(Default)]
struct BagOfWords {
    calls: AtomicUsize,
}

impl BagOfWords {
    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

struct Env {
    _tmp: TempDir,
    app: App,
    embedder: Arc<BagOfWords>,
}

fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.paths.kb_root = tmp.path().join("Knowledge");
    config.paths.store_root = tmp.path().join("Databases");
    config.retrieval.final_limit = 3;

    let embedder = Arc::new(BagOfWords::default());
    let sqlite = Arc::new(SqliteStore::new(KbLayout::from_config(&config.paths)));
    let app = App::with_parts(config, sqlite, embedder.clone()).unwrap();
    Env {
        _tmp: tmp,
        app,
        embedder,
    }
}

fn write_doc(env: &Env, kb: &str, name: &str, text: &str) {
    let manager = &env.app.manager;
    manager.ensure_skeleton(kb).unwrap();
    std::fs::write(manager.layout().docs_dir(kb).join(name), text).unwrap();
}

fn kbs(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn build_then_retrieve_single_document() {
    let env = env();
    write_doc(&env, "docs_demo", "france.txt", "Paris is the capital of France.");

    let reports = env.app.manager.build(Some("docs_demo")).await.unwrap();
    assert_eq!(reports[0].documents, 1);
    assert_eq!(reports[0].chunks, 1);

    let out = env
        .app
        .retriever
        .retrieve("What is the capital of France?", &kbs(&["docs_demo"]))
        .await
        .unwrap();
    assert!(out.context.as_deref().unwrap().contains("Paris"));
    assert_eq!(out.sources.len(), 1);
    assert!(out.sources[0].ends_with("france.txt (KB: docs_demo)"));
    env.app.shutdown().await;
}

#[tokio::test]
async fn unknown_knowledge_base_yields_nothing() {
    let env = env();
    let out = env
        .app
        .retriever
        .retrieve("hello", &kbs(&["nonexistent_kb"]))
        .await
        .unwrap();
    assert!(out.context.is_none());
    assert!(out.sources.is_empty());
    assert_eq!(env.embedder.calls.load(Ordering::SeqCst), 0);
    assert!(!env.app.manager.layout().store_file("nonexistent_kb").exists());
}

#[tokio::test]
async fn empty_selection_makes_no_embedding_calls() {
    let env = env();
    write_doc(&env, "geo", "a.txt", "rivers and mountains");
    env.app.manager.build(Some("geo")).await.unwrap();
    let before = env.embedder.calls.load(Ordering::SeqCst);

    let out = env.app.retriever.retrieve("rivers", &[]).await.unwrap();
    assert!(out.context.is_none());
    assert_eq!(env.embedder.calls.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn results_merge_across_knowledge_bases_by_score() {
    let env = env();
    write_doc(&env, "alpha", "a.txt", "rust compiler borrow checker lifetimes");
    write_doc(&env, "beta", "b.txt", "rust compiler");
    write_doc(&env, "gamma", "c.txt", "gardening tomatoes soil");
    env.app.manager.build(None).await.unwrap();

    let query = "rust compiler borrow checker";
    let expected = vec![
        "a.txt (KB: alpha)".to_string(),
        "b.txt (KB: beta)".to_string(),
        "c.txt (KB: gamma)".to_string(),
    ];
    for order in [["alpha", "beta", "gamma"], ["gamma", "alpha", "beta"]] {
        let out = env.app.retriever.retrieve(query, &kbs(&order)).await.unwrap();
        let sources: Vec<String> = out
            .sources
            .iter()
            .map(|s| s.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(sources, expected);
    }
}

#[tokio::test]
async fn worker_builds_and_retrieves_through_queue() {
    let env = env();
    write_doc(&env, "geo", "a.txt", "Paris is the capital of France.");

    let (worker, join) = env.app.spawn_worker();
    let reports = worker.build(Some("geo".into())).await.unwrap();
    assert_eq!(reports[0].chunks, 1);
    let out = worker
        .retrieve("capital of France".into(), kbs(&["geo"]))
        .await
        .unwrap();
    drop(worker);
    join.await.unwrap();

    assert!(out.context.as_deref().unwrap().contains("Paris"));
    assert!(out.sources[0].ends_with("a.txt (KB: geo)"));
}

#[tokio::test]
async fn rebuild_appends_duplicates() {
    let env = env();
    write_doc(&env, "notes", "n.txt", "same content every time");
    env.app.manager.build(Some("notes")).await.unwrap();
    env.app.manager.build(Some("notes")).await.unwrap();
    assert_eq!(env.app.sqlite.count("notes").await.unwrap(), 2);
}

#[tokio::test]
async fn store_survives_reopen() {
    let env = env();
    write_doc(&env, "geo", "a.txt", "Paris is the capital of France.");
    env.app.manager.build(Some("geo")).await.unwrap();
    env.app.shutdown().await;

    let reopened = SqliteStore::new(env.app.manager.layout().clone());
    assert!(reopened.exists("geo").await.unwrap());
    assert_eq!(reopened.count("geo").await.unwrap(), 1);
    reopened.close().await;
}

#[test]
fn add_source_twice_creates_one_skeleton() {
    let env = env();
    let manager = &env.app.manager;
    manager.add_source("fresh", None, None).unwrap();
    manager.add_source("fresh", None, None).unwrap();

    let kb_dir = manager.layout().kb_dir("fresh");
    let mut entries: Vec<String> = std::fs::read_dir(&kb_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["docs", "urls.txt"]);
}

struct StubCapture;

impl ScreenCapture for StubCapture {
    fn capture(&self) -> Result<Vec<u8>, CommandError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

#[test]
fn command_matcher_scenarios() {
    let matcher = CommandMatcher::new(Arc::new(StubCapture)).unwrap();

    let shot = matcher.match_query("take a screenshot of my screen").unwrap();
    match shot {
        Some(CommandResult::Image(msg)) => {
            assert!(matches!(msg.content, Content::Image { .. }))
        }
        other => panic!("expected image, got {:?}", other),
    }
    assert_eq!(matcher.match_query("what is 2+2").unwrap(), None);

    // Screenshot pattern is tried before the path pattern.
    let both = matcher
        .match_query("show my screen and /tmp/x/picture.png")
        .unwrap();
    assert!(matches!(both, Some(CommandResult::Image(_))));
}
