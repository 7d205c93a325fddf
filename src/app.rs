//! Component wiring shared by the CLI commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use kb_assist_core::embedding::EmbeddingProvider;
use kb_assist_core::store::KnowledgeStore;

use crate::chat::ChatEngine;
use crate::commands::CommandMatcher;
use crate::config::Config;
use crate::embedding::create_provider;
use crate::layout::KbLayout;
use crate::llm::create_chat_model;
use crate::manager::KnowledgeBaseManager;
use crate::prompt::DEFAULT_SYSTEM_MESSAGE;
use crate::retrieve::{ContextRetriever, LlmCompressor};
use crate::sqlite_store::SqliteStore;
use crate::worker::{Worker, WorkerHandle};

const WORKER_QUEUE_CAPACITY: usize = 8;

/// Long-lived components built once from a [`Config`].
pub struct App {
    pub config: Config,
    pub sqlite: Arc<SqliteStore>,
    pub manager: Arc<KnowledgeBaseManager>,
    pub retriever: Arc<ContextRetriever>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let sqlite = Arc::new(SqliteStore::new(KbLayout::from_config(&config.paths)));
        Self::with_parts(config, sqlite, embedder)
    }

    pub fn with_parts(
        config: Config,
        sqlite: Arc<SqliteStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let store: Arc<dyn KnowledgeStore> = sqlite.clone();
        let manager = Arc::new(KnowledgeBaseManager::new(
            &config,
            store.clone(),
            embedder.clone(),
        )?);

        let mut retriever = ContextRetriever::new(&config, store, embedder);
        if config.retrieval.compress {
            let model = create_chat_model(&config.llm)
                .context("[retrieval] compress = true requires a chat model")?;
            debug!(model = model.name(), "contextual compression enabled");
            retriever = retriever.with_compressor(Arc::new(LlmCompressor::new(model)));
        }

        Ok(Self {
            config,
            sqlite,
            manager,
            retriever: Arc::new(retriever),
        })
    }

    /// Base system message: the configured override or the built-in one.
    pub fn system_message(&self) -> &str {
        self.config
            .agent
            .system_message
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_MESSAGE)
    }

    /// Start the background worker over this app's manager and retriever.
    pub fn spawn_worker(&self) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
        Worker::spawn(self.manager.clone(), self.retriever.clone(), WORKER_QUEUE_CAPACITY)
    }

    pub fn chat_engine(&self) -> Result<ChatEngine> {
        let model = create_chat_model(&self.config.llm)?;
        let mut engine = ChatEngine::new(
            CommandMatcher::with_system_capture()?,
            self.retriever.clone(),
            model,
            self.system_message(),
        );
        if let Some(path) = &self.config.agent.conversation_history_path {
            engine = engine.with_history(path);
        }
        Ok(engine)
    }

    pub async fn shutdown(&self) {
        self.sqlite.close().await;
    }
}
