//! One chat turn: command matcher, then retrieval, then the streamed reply.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use kb_assist_core::models::Message;

use crate::commands::{CommandMatcher, CommandResult};
use crate::llm::ChatModel;
use crate::prompt::build_user_prompt;
use crate::retrieve::{ContextRetriever, RetrievedContext};
use crate::session::Session;

/// Shared interrupt flag, checked before each streamed token.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnOutcome {
    /// Tokens received before the turn ended or was interrupted.
    pub response: String,
    pub sources: Vec<String>,
    pub interrupted: bool,
    /// The input was handled as a command and retrieval was skipped.
    pub command: bool,
}

#[derive(Serialize)]
struct HistoryRecord<'a> {
    timestamp: String,
    input: &'a str,
    knowledge_bases: &'a [String],
    #[serde(flatten)]
    outcome: &'a TurnOutcome,
}

pub struct ChatEngine {
    matcher: CommandMatcher,
    retriever: Arc<ContextRetriever>,
    model: Arc<dyn ChatModel>,
    system_message: String,
    history_path: Option<PathBuf>,
}

impl ChatEngine {
    pub fn new(
        matcher: CommandMatcher,
        retriever: Arc<ContextRetriever>,
        model: Arc<dyn ChatModel>,
        system_message: impl Into<String>,
    ) -> Self {
        Self {
            matcher,
            retriever,
            model,
            system_message: system_message.into(),
            history_path: None,
        }
    }

    pub fn with_history(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    /// Run one turn for `input`, passing each token to `on_token`.
    ///
    /// Retrieval failures are logged and the query goes out without
    /// context. Chat-model and screen-capture failures are returned.
    pub async fn process_input<F>(
        &self,
        input: &str,
        session: &Session,
        cancel: &CancelFlag,
        mut on_token: F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(&str),
    {
        cancel.reset();
        let selected = session.selected();
        let system = Message::system(session.system_message(&self.system_message));

        let mut outcome = TurnOutcome::default();
        let user = match self.matcher.match_query(input)? {
            Some(CommandResult::Image(image)) => {
                outcome.command = true;
                image
            }
            Some(CommandResult::Unchanged(query)) => self.augment(&query, &selected, &mut outcome).await,
            None => self.augment(input, &selected, &mut outcome).await,
        };

        if cancel.is_cancelled() {
            outcome.interrupted = true;
            self.record(input, &selected, &outcome);
            return Ok(outcome);
        }

        let mut stream = self
            .model
            .stream(&[system, user])
            .await
            .with_context(|| format!("{} request failed", self.model.name()))?;
        while let Some(token) = stream.next().await {
            if cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
            let token = token?;
            on_token(&token);
            outcome.response.push_str(&token);
        }

        if outcome.interrupted {
            info!(tokens = outcome.response.len(), "response interrupted");
        }
        self.record(input, &selected, &outcome);
        Ok(outcome)
    }

    async fn augment(&self, query: &str, selected: &[String], outcome: &mut TurnOutcome) -> Message {
        let retrieved = match self.retriever.retrieve(query, selected).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "retrieval failed; continuing without context");
                RetrievedContext::empty()
            }
        };
        debug!(sources = retrieved.sources.len(), "context assembled");
        outcome.sources = retrieved.sources;
        Message::user(build_user_prompt(query, retrieved.context.as_deref()))
    }

    fn record(&self, input: &str, selected: &[String], outcome: &TurnOutcome) {
        let Some(path) = &self.history_path else {
            return;
        };
        if let Err(e) = append_history(path, input, selected, outcome) {
            warn!(path = %path.display(), error = %e, "could not write conversation history");
        }
    }
}

fn append_history(
    path: &Path,
    input: &str,
    selected: &[String],
    outcome: &TurnOutcome,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let record = HistoryRecord {
        timestamp: chrono::Utc::now().to_rfc3339(),
        input,
        knowledge_bases: selected,
        outcome,
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", serde_json::to_string(&record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandError, ScreenCapture};
    use crate::config::Config;
    use crate::llm::TokenStream;
    use async_trait::async_trait;
    use kb_assist_core::embedding::EmbeddingProvider;
    use kb_assist_core::models::{Chunk, Content};
    use kb_assist_core::store::memory::InMemoryStore;
    use kb_assist_core::store::KnowledgeStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ScriptedModel {
        tokens: Vec<&'static str>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tokens,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_user(&self) -> Message {
            self.seen.lock().unwrap().last().unwrap()[1].clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, messages: &[Message]) -> Result<TokenStream> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let tokens: Vec<Result<String>> =
                self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            Ok(futures::stream::iter(tokens).boxed())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn stream(&self, _messages: &[Message]) -> Result<TokenStream> {
            anyhow::bail!("HTTP 401")
        }
    }

    struct UnitEmbedder {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("embedding service unavailable");
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct FakeCapture;

    impl ScreenCapture for FakeCapture {
        fn capture(&self) -> Result<Vec<u8>, CommandError> {
            Ok(vec![1, 2, 3])
        }
    }

    struct Fixture {
        engine: ChatEngine,
        model: Arc<ScriptedModel>,
        embedder: Arc<UnitEmbedder>,
        session: Session,
    }

    async fn fixture(tokens: Vec<&'static str>, embed_fails: bool) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let chunk = Chunk {
            id: "1".into(),
            content: "Paris is the capital of France.".into(),
            source: "paris.txt".into(),
            start_offset: 0,
            knowledge_base: None,
            hash: String::new(),
        };
        store.upsert("geo", &[chunk], &[vec![1.0, 0.0]], "unit").await.unwrap();

        let embedder = Arc::new(UnitEmbedder {
            fail: embed_fails,
            calls: AtomicUsize::new(0),
        });
        let retriever = Arc::new(ContextRetriever::new(
            &Config::default(),
            store,
            embedder.clone(),
        ));
        let model = ScriptedModel::new(tokens);
        let engine = ChatEngine::new(
            CommandMatcher::new(Arc::new(FakeCapture)).unwrap(),
            retriever,
            model.clone(),
            "BASE",
        );
        let mut session = Session::new();
        // "geo" has a store but no directory; selecting only reads optional files.
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.kb_root = dir.path().join("Knowledge");
        let manager = crate::manager::KnowledgeBaseManager::new(
            &config,
            Arc::new(InMemoryStore::new()),
            embedder.clone(),
        )
        .unwrap();
        session.select(&manager, "geo").unwrap();

        Fixture {
            engine,
            model,
            embedder,
            session,
        }
    }

    #[tokio::test]
    async fn test_turn_with_context() {
        let f = fixture(vec!["The ", "capital ", "is Paris."], false).await;
        let mut streamed = Vec::new();
        let outcome = f
            .engine
            .process_input("What is the capital of France", &f.session, &CancelFlag::new(), |t| {
                streamed.push(t.to_string())
            })
            .await
            .unwrap();

        assert_eq!(outcome.response, "The capital is Paris.");
        assert_eq!(streamed.len(), 3);
        assert_eq!(outcome.sources, vec!["paris.txt (KB: geo)"]);
        assert!(!outcome.interrupted);
        assert_eq!(
            f.model.last_user().as_text(),
            Some("Context: Paris is the capital of France.\n\nQuery: What is the capital of France")
        );
    }

    #[tokio::test]
    async fn test_cancel_discards_remaining_tokens() {
        let f = fixture(vec!["one ", "two ", "three"], false).await;
        let cancel = CancelFlag::new();
        let outcome = f
            .engine
            .process_input("hello", &f.session, &cancel, |_| cancel.cancel())
            .await
            .unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.response, "one ");
    }

    #[tokio::test]
    async fn test_command_skips_retrieval() {
        let f = fixture(vec!["A terminal window."], false).await;
        let outcome = f
            .engine
            .process_input("what's on my screen", &f.session, &CancelFlag::new(), |_| {})
            .await
            .unwrap();
        assert!(outcome.command);
        assert!(outcome.sources.is_empty());
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(f.model.last_user().content, Content::Image { .. }));
    }

    #[tokio::test]
    async fn test_retrieval_failure_degrades_to_plain_query() {
        let f = fixture(vec!["ok"], true).await;
        let outcome = f
            .engine
            .process_input("hello", &f.session, &CancelFlag::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.response, "ok");
        assert!(outcome.sources.is_empty());
        assert_eq!(f.model.last_user().as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_model_failure_is_returned() {
        let f = fixture(vec![], false).await;
        let engine = ChatEngine::new(
            CommandMatcher::new(Arc::new(FakeCapture)).unwrap(),
            f.engine.retriever.clone(),
            Arc::new(FailingModel),
            "BASE",
        );
        let err = engine
            .process_input("hello", &f.session, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("HTTP 401"));
    }

    #[tokio::test]
    async fn test_history_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("history.jsonl");
        let f = fixture(vec!["hi"], false).await;
        let engine = f.engine.with_history(&path);

        for _ in 0..2 {
            engine
                .process_input("hello", &f.session, &CancelFlag::new(), |_| {})
                .await
                .unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["input"], "hello");
        assert_eq!(lines[0]["response"], "hi");
        assert_eq!(lines[0]["knowledge_bases"][0], "geo");
    }
}
