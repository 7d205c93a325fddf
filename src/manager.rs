//! Knowledge-base manager: staging sources and building stores.
//!
//! Ingestion is two-phase. [`add_source`](KnowledgeBaseManager::add_source)
//! only stages a file or URL on disk; [`build`](KnowledgeBaseManager::build)
//! runs loader → chunker → embedder → store for one or every knowledge base.
//! Building is additive: re-running it on unchanged sources appends the same
//! chunks again (each carries a content hash).

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use kb_assist_core::chunk::{split_documents, ChunkParams};
use kb_assist_core::embedding::{embed_batched, EmbeddingProvider};
use kb_assist_core::models::Document;
use kb_assist_core::store::KnowledgeStore;

use crate::config::Config;
use crate::layout::{validate_kb_name, KbLayout};
use crate::loader::{read_url_list, DocumentLoader};

/// A named instruction document attached to a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skill {
    pub name: String,
    pub path: PathBuf,
}

/// Outcome of building one knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub knowledge_base: String,
    pub documents: usize,
    pub chunks: usize,
}

pub struct KnowledgeBaseManager {
    layout: KbLayout,
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    loader: DocumentLoader,
    chunk_params: ChunkParams,
    /// Set when skills are also embedded into the store.
    skill_params: Option<ChunkParams>,
    batch_size: usize,
}

impl KnowledgeBaseManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let skill_params = if config.chunking.skills.index_skills {
            Some(config.skill_chunk_params()?)
        } else {
            None
        };
        Ok(Self {
            layout: KbLayout::from_config(&config.paths),
            store,
            embedder,
            loader: DocumentLoader::new(Duration::from_secs(config.embedding.timeout_secs))?,
            chunk_params: config.chunk_params()?,
            skill_params,
            batch_size: config.embedding.batch_size,
        })
    }

    pub fn layout(&self) -> &KbLayout {
        &self.layout
    }

    /// Names of every knowledge base directory under the kb root.
    pub fn known_knowledge_bases(&self) -> Result<BTreeSet<String>> {
        let root = self.layout.kb_root();
        if !root.is_dir() {
            return Ok(BTreeSet::new());
        }
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("Failed to list {}", root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && validate_kb_name(&name).is_ok() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Create `docs/` and an empty `urls.txt` if they do not exist yet.
    pub fn ensure_skeleton(&self, kb: &str) -> Result<()> {
        validate_kb_name(kb)?;
        let docs = self.layout.docs_dir(kb);
        std::fs::create_dir_all(&docs)
            .with_context(|| format!("Failed to create {}", docs.display()))?;
        let urls = self.layout.urls_file(kb);
        if !urls.exists() {
            std::fs::write(&urls, "")
                .with_context(|| format!("Failed to create {}", urls.display()))?;
        }
        Ok(())
    }

    /// Stage a URL and/or a file for the next [`build`](Self::build).
    ///
    /// A URL already listed is not added twice.
    pub fn add_source(&self, kb: &str, url: Option<&str>, file_path: Option<&Path>) -> Result<()> {
        self.ensure_skeleton(kb)?;

        if let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) {
            let urls_file = self.layout.urls_file(kb);
            if read_url_list(&urls_file)?.iter().any(|u| u == url) {
                info!(kb = %kb, url = %url, "URL already listed");
            } else {
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&urls_file)
                    .with_context(|| format!("Failed to open {}", urls_file.display()))?;
                let existing = std::fs::read_to_string(&urls_file)?;
                if !existing.is_empty() && !existing.ends_with('\n') {
                    writeln!(file)?;
                }
                writeln!(file, "{}", url)?;
                info!(kb = %kb, url = %url, "staged URL");
            }
        }

        if let Some(path) = file_path {
            let Some(name) = path.file_name() else {
                bail!("not a file path: {}", path.display());
            };
            let dest = self.layout.docs_dir(kb).join(name);
            if same_file(path, &dest) {
                info!(kb = %kb, file = %dest.display(), "file already staged");
                return Ok(());
            }
            std::fs::copy(path, &dest).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), dest.display())
            })?;
            info!(kb = %kb, file = %dest.display(), "staged file");
        }

        Ok(())
    }

    /// Ingest one knowledge base, or every known one when `kb` is `None`.
    pub async fn build(&self, kb: Option<&str>) -> Result<Vec<BuildReport>> {
        let names: Vec<String> = match kb {
            Some(name) => vec![name.to_string()],
            None => self.known_knowledge_bases()?.into_iter().collect(),
        };

        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.build_one(&name).await?);
        }
        Ok(reports)
    }

    async fn build_one(&self, kb: &str) -> Result<BuildReport> {
        self.ensure_skeleton(kb)?;

        let documents = self
            .loader
            .load(&self.layout.docs_dir(kb), &self.layout.urls_file(kb))
            .await?;
        let mut chunks = split_documents(&documents, &self.chunk_params);

        let mut document_count = documents.len();
        if let Some(params) = &self.skill_params {
            let skills = self.skill_documents(kb)?;
            document_count += skills.len();
            chunks.extend(split_documents(&skills, params));
        }

        if chunks.is_empty() {
            warn!(kb = %kb, documents = document_count, "nothing to index");
            return Ok(BuildReport {
                knowledge_base: kb.to_string(),
                documents: document_count,
                chunks: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, self.batch_size)
            .await
            .with_context(|| format!("embedding failed for knowledge base '{}'", kb))?;
        let written = self
            .store
            .upsert(kb, &chunks, &vectors, self.embedder.model_name())
            .await?;

        info!(kb = %kb, documents = document_count, chunks = written, "built knowledge base");
        Ok(BuildReport {
            knowledge_base: kb.to_string(),
            documents: document_count,
            chunks: written,
        })
    }

    fn skill_documents(&self, kb: &str) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        for skill in self.load_skills(kb)? {
            match std::fs::read_to_string(&skill.path) {
                Ok(text) => docs.push(
                    Document::new(text, skill.path.display().to_string())
                        .with_metadata("source_type", "skill")
                        .with_metadata("skill", skill.name),
                ),
                Err(e) => warn!(path = %skill.path.display(), error = %e, "skipping skill"),
            }
        }
        Ok(docs)
    }

    /// `skills/*.md`, sorted by name. Empty when the directory is absent.
    pub fn load_skills(&self, kb: &str) -> Result<Vec<Skill>> {
        validate_kb_name(kb)?;
        let dir = self.layout.skills_dir(kb);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut skills = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = entry.path();
            let is_md = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("md"));
            if !entry.file_type().is_file() || !is_md {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                skills.push(Skill {
                    name: stem.to_string_lossy().to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(skills)
    }

    /// Contents of `instructions.txt`, or an empty string when absent.
    pub fn load_instructions(&self, kb: &str) -> Result<String> {
        validate_kb_name(kb)?;
        let path = self.layout.instructions_file(kb);
        if !path.is_file() {
            return Ok(String::new());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(text.trim().to_string())
    }
}

/// True when both paths resolve to the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
