//! TOML configuration.
//!
//! The whole file is deserialized into [`Config`] once at startup and
//! passed by reference into every component. Every section has defaults,
//! so an empty file is a valid configuration (embedding disabled).
//!
//! ```toml
//! [paths]
//! kb_root = "Knowledge"
//! store_root = "Databases"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [retrieval]
//! strategy = "mmr"
//! k = 5
//! fetch_k = 25
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "anthropic"
//! model = "claude-3-5-sonnet-20241022"
//!
//! [session]
//! selected = ["docs_demo"]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use kb_assist_core::chunk::ChunkParams;
use kb_assist_core::search::{SearchParams, SearchStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub logging: LogConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Holds `<kb>/docs`, `<kb>/urls.txt`, `<kb>/skills` and `<kb>/instructions.txt`.
    pub kb_root: PathBuf,
    /// Holds one vector store directory per knowledge base.
    pub store_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            kb_root: PathBuf::from("Knowledge"),
            store_root: PathBuf::from("Databases"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub skills: SkillChunkingConfig,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            skills: SkillChunkingConfig::default(),
        }
    }
}

/// Coarse profile for hand-written skill documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Also embed `skills/*.md` into the knowledge base's store on build.
    pub index_skills: bool,
}

impl Default for SkillChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            chunk_overlap: 0,
            index_skills: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    Mmr,
    Similarity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    pub k: usize,
    pub fetch_k: usize,
    pub mmr_lambda: f32,
    pub final_limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_threshold: Option<f32>,
    /// Run each candidate through the chat model and keep only the relevant extract.
    pub compress: bool,
    pub separator: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Mmr,
            k: 5,
            fetch_k: 25,
            mmr_lambda: 0.5,
            final_limit: 10,
            relevance_threshold: None,
            compress: false,
            separator: "\n\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAi,
    Azure,
    Anthropic,
}

impl LlmProviderKind {
    /// Environment variable holding the API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "OPENAI_API_KEY",
            LlmProviderKind::Azure => "AZURE_API_KEY",
            LlmProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    pub model: String,
    /// Required for Azure (`https://<resource>.openai.azure.com`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::OpenAi,
            model: "gpt-4o".to_string(),
            api_base: None,
            api_version: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 2,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Replaces the built-in system message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    /// JSON lines file that each finished turn is appended to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Persisted defaults for the selected-knowledge-base set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub selected: Vec<String>,
}

impl Config {
    /// Fine-grained chunking profile for knowledge-base documents.
    pub fn chunk_params(&self) -> Result<ChunkParams> {
        ChunkParams::new(self.chunking.chunk_size, self.chunking.chunk_overlap)
            .context("invalid [chunking] settings")
    }

    /// Coarse chunking profile for skill documents.
    pub fn skill_chunk_params(&self) -> Result<ChunkParams> {
        let s = &self.chunking.skills;
        ChunkParams::new(s.chunk_size, s.chunk_overlap).context("invalid [chunking.skills] settings")
    }

    pub fn search_params(&self) -> SearchParams {
        let r = &self.retrieval;
        let strategy = match r.strategy {
            RetrievalStrategy::Mmr => SearchStrategy::Mmr {
                lambda: r.mmr_lambda,
            },
            RetrievalStrategy::Similarity => SearchStrategy::Similarity,
        };
        SearchParams {
            strategy,
            k: r.k,
            fetch_k: r.fetch_k,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunk_params()?;
        self.skill_chunk_params()?;

        let r = &self.retrieval;
        if r.k < 1 {
            bail!("retrieval.k must be >= 1");
        }
        if r.fetch_k < r.k {
            bail!("retrieval.fetch_k ({}) must be >= retrieval.k ({})", r.fetch_k, r.k);
        }
        if r.final_limit < 1 {
            bail!("retrieval.final_limit must be >= 1");
        }
        if !(0.0..=1.0).contains(&r.mmr_lambda) {
            bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
        }
        if let Some(t) = r.relevance_threshold {
            if !t.is_finite() {
                bail!("retrieval.relevance_threshold must be a finite number");
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }

        if self.llm.provider == LlmProviderKind::Azure && self.llm.api_base.is_none() {
            bail!("llm.api_base is required when provider is 'azure'");
        }

        Ok(())
    }

    /// Write the whole configuration back to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

/// Read, parse and validate the config file.
///
/// A missing file at `path` yields the validated defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config file")
}
