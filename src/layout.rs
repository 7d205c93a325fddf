//! On-disk layout of knowledge bases.
//!
//! ```text
//! <kb_root>/<kb>/docs/*              raw source files
//! <kb_root>/<kb>/urls.txt            one URL per line
//! <kb_root>/<kb>/skills/*.md         named instruction snippets
//! <kb_root>/<kb>/instructions.txt    system-prompt augmentation
//! <store_root>/<kb>/store.sqlite     vector store
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::config::PathsConfig;

const STORE_FILE: &str = "store.sqlite";

#[derive(Debug, Clone)]
pub struct KbLayout {
    kb_root: PathBuf,
    store_root: PathBuf,
}

impl KbLayout {
    pub fn new(kb_root: impl Into<PathBuf>, store_root: impl Into<PathBuf>) -> Self {
        Self {
            kb_root: kb_root.into(),
            store_root: store_root.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.kb_root, &paths.store_root)
    }

    pub fn kb_root(&self) -> &Path {
        &self.kb_root
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    pub fn kb_dir(&self, kb: &str) -> PathBuf {
        self.kb_root.join(kb)
    }

    pub fn docs_dir(&self, kb: &str) -> PathBuf {
        self.kb_dir(kb).join("docs")
    }

    pub fn urls_file(&self, kb: &str) -> PathBuf {
        self.kb_dir(kb).join("urls.txt")
    }

    pub fn skills_dir(&self, kb: &str) -> PathBuf {
        self.kb_dir(kb).join("skills")
    }

    pub fn instructions_file(&self, kb: &str) -> PathBuf {
        self.kb_dir(kb).join("instructions.txt")
    }

    pub fn store_dir(&self, kb: &str) -> PathBuf {
        self.store_root.join(kb)
    }

    pub fn store_file(&self, kb: &str) -> PathBuf {
        self.store_dir(kb).join(STORE_FILE)
    }
}

/// Knowledge-base names become single path components.
pub fn validate_kb_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("knowledge base name must not be empty");
    }
    if name.starts_with('.') || name.contains(['/', '\\', ':']) || name.contains('\0') {
        bail!("invalid knowledge base name: '{}'", name);
    }
    Ok(())
}
