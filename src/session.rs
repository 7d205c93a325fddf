//! The selected-knowledge-base set for an interactive session.
//!
//! Skills and instructions are attached when a knowledge base is selected
//! and dropped when it is deselected; nothing is re-read at query time.

use anyhow::Result;
use tracing::debug;

use crate::manager::{KnowledgeBaseManager, Skill};
use crate::prompt::{build_system_message, KbAugment};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveKb {
    name: String,
    skills: Vec<Skill>,
    instructions: String,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    active: Vec<ActiveKb>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `names` selected, in order. Duplicates are ignored.
    pub fn with_selection(manager: &KnowledgeBaseManager, names: &[String]) -> Result<Self> {
        let mut session = Self::new();
        for name in names {
            session.select(manager, name)?;
        }
        Ok(session)
    }

    /// Selected knowledge-base names in selection order.
    pub fn selected(&self) -> Vec<String> {
        self.active.iter().map(|kb| kb.name.clone()).collect()
    }

    pub fn is_selected(&self, kb: &str) -> bool {
        self.active.iter().any(|a| a.name == kb)
    }

    /// Returns `false` if `kb` was already selected.
    pub fn select(&mut self, manager: &KnowledgeBaseManager, kb: &str) -> Result<bool> {
        if self.is_selected(kb) {
            return Ok(false);
        }
        let skills = manager.load_skills(kb)?;
        let instructions = manager.load_instructions(kb)?;
        debug!(kb = %kb, skills = skills.len(), "selected knowledge base");
        self.active.push(ActiveKb {
            name: kb.to_string(),
            skills,
            instructions,
        });
        Ok(true)
    }

    /// Returns `false` if `kb` was not selected.
    pub fn deselect(&mut self, kb: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|a| a.name != kb);
        before != self.active.len()
    }

    /// Flip selection of `kb`; returns whether it is selected afterwards.
    pub fn toggle(&mut self, manager: &KnowledgeBaseManager, kb: &str) -> Result<bool> {
        if self.deselect(kb) {
            Ok(false)
        } else {
            self.select(manager, kb)
        }
    }

    pub fn skills(&self) -> impl Iterator<Item = &Skill> {
        self.active.iter().flat_map(|a| a.skills.iter())
    }

    /// `base` extended with the skills and instructions of every selected kb.
    pub fn system_message(&self, base: &str) -> String {
        let augments: Vec<KbAugment<'_>> = self
            .active
            .iter()
            .map(|a| KbAugment {
                knowledge_base: &a.name,
                skills: &a.skills,
                instructions: &a.instructions,
            })
            .collect();
        build_system_message(base, &augments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use kb_assist_core::embedding::EmbeddingProvider;
    use kb_assist_core::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NoEmbedder;

    #[async_trait]
    impl EmbeddingProvider for NoEmbedder {
        fn model_name(&self) -> &str {
            "none"
        }
        fn dims(&self) -> usize {
            0
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("not used")
        }
    }

    fn manager() -> (TempDir, KnowledgeBaseManager) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.kb_root = dir.path().join("Knowledge");
        config.paths.store_root = dir.path().join("Databases");
        let manager = KnowledgeBaseManager::new(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(NoEmbedder),
        )
        .unwrap();

        let layout = manager.layout();
        std::fs::create_dir_all(layout.skills_dir("geo")).unwrap();
        std::fs::write(layout.skills_dir("geo").join("plot_map.md"), "steps").unwrap();
        std::fs::write(layout.instructions_file("geo"), "Answer in French.").unwrap();
        std::fs::create_dir_all(layout.docs_dir("plain")).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_select_attaches_and_deselect_detaches() {
        let (_dir, manager) = manager();
        let mut session = Session::new();

        assert!(session.select(&manager, "geo").unwrap());
        assert!(!session.select(&manager, "geo").unwrap());
        let msg = session.system_message("BASE");
        assert!(msg.contains("- plot_map (Path: "));
        assert!(msg.contains("# Instructions (geo)\nAnswer in French."));

        assert!(session.deselect("geo"));
        assert!(!session.deselect("geo"));
        assert_eq!(session.system_message("BASE"), "BASE");
        assert_eq!(session.skills().count(), 0);
    }

    #[test]
    fn test_toggle_and_order() {
        let (_dir, manager) = manager();
        let mut session =
            Session::with_selection(&manager, &["plain".to_string(), "geo".to_string()]).unwrap();
        assert_eq!(session.selected(), vec!["plain", "geo"]);

        assert!(!session.toggle(&manager, "plain").unwrap());
        assert_eq!(session.selected(), vec!["geo"]);
        assert!(session.toggle(&manager, "plain").unwrap());
        assert_eq!(session.selected(), vec!["geo", "plain"]);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (_dir, manager) = manager();
        let mut session = Session::new();
        assert!(session.select(&manager, "../etc").is_err());
        assert!(session.selected().is_empty());
    }
}
