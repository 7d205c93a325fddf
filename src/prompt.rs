//! Prompt assembly.
//!
//! The system message is the base prompt, then a skills section naming every
//! active skill file, then the instructions of each active knowledge base.
//! The user prompt carries the retrieved context, if any, ahead of the query.

use crate::manager::Skill;

pub const DEFAULT_SYSTEM_MESSAGE: &str = "\
You are a capable assistant that can run code on the user's machine to get tasks done.
Before acting, write a short plan. Keep each step small and check its result before moving on.
When the user's message includes a Context block, treat it as reference material retrieved \
from their knowledge bases: prefer it over your own recollection and say so when it does not \
answer the question.
Skills are step-by-step procedures stored as files. When a listed skill matches the task, \
read the file at its path and follow it.";

/// Characters stripped from the user's query. Retrieved context is passed
/// through untouched.
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

pub fn sanitize(text: &str) -> String {
    text.chars().filter(|c| !UNSAFE_CHARS.contains(c)).collect()
}

/// `Context: {context}\n\nQuery: {query}`, or just the query without context.
pub fn build_user_prompt(query: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Context: {}\n\nQuery: {}", ctx, sanitize(query))
        }
        _ => sanitize(query),
    }
}

/// Skills and instructions contributed by one active knowledge base.
#[derive(Debug, Clone, Default)]
pub struct KbAugment<'a> {
    pub knowledge_base: &'a str,
    pub skills: &'a [Skill],
    pub instructions: &'a str,
}

pub fn build_system_message(base: &str, augments: &[KbAugment<'_>]) -> String {
    let mut out = base.trim_end().to_string();

    let skill_lines: Vec<String> = augments
        .iter()
        .flat_map(|a| a.skills.iter())
        .map(|s| format!("- {} (Path: {})", s.name, s.path.display()))
        .collect();
    if !skill_lines.is_empty() {
        out.push_str("\n\n# Skills\n");
        out.push_str(&skill_lines.join("\n"));
    }

    for augment in augments {
        let text = augment.instructions.trim();
        if !text.is_empty() {
            out.push_str(&format!(
                "\n\n# Instructions ({})\n{}",
                augment.knowledge_base, text
            ));
        }
    }

    out
}
