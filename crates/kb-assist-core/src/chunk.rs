//! Recursive, boundary-aware text chunker with overlap.
//!
//! Splits document content into windows of at most `chunk_size`
//! characters. Consecutive windows overlap by up to `chunk_overlap`
//! characters. Each window is an exact slice of the source text, so
//! `start_offset` plus the chunk content locate it precisely.
//!
//! # Algorithm
//!
//! 1. Take a window of `chunk_size` characters starting at the cursor.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise cut at the last paragraph break (`\n\n`) in the window;
//!    failing that the last line break, then the last sentence boundary,
//!    then the last whitespace. A cut is only accepted if it leaves more
//!    than `chunk_overlap` characters in the chunk, which guarantees the
//!    cursor always advances.
//! 4. If no boundary qualifies, hard-cut at the window end.
//! 5. Move the cursor back `chunk_overlap` characters from the cut and
//!    forward to the next word start inside the overlap region.
//!
//! The same function serves fine-grained knowledge-base ingestion
//! (small windows, overlap) and coarse skill ingestion (large windows,
//! no overlap); only [`ChunkParams`] differ.
//!
//! # Example
//!
//! ```rust
//! use kb_assist_core::chunk::{split_documents, ChunkParams};
//! use kb_assist_core::models::Document;
//!
//! let params = ChunkParams::new(1000, 200).unwrap();
//! let docs = vec![Document::new("Hello world.\n\nSecond paragraph.", "a.txt")];
//! let chunks = split_documents(&docs, &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].start_offset, 0);
//! ```

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Window size and overlap, both in characters.
///
/// Only constructible through [`ChunkParams::new`], so a value in hand is
/// always valid and splitting never fails at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkParams {
    /// Validate and build chunking parameters.
    ///
    /// # Errors
    ///
    /// `chunk_size` must be positive and `chunk_overlap` strictly smaller.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

/// A borrowed window of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan<'a> {
    /// Character offset of `text` within the document.
    pub start_offset: usize,
    pub text: &'a str,
}

/// Split every document into chunks, preserving document order.
///
/// Chunks are untagged (`knowledge_base == None`); the store assigns the
/// knowledge base when they are saved.
pub fn split_documents(documents: &[Document], params: &ChunkParams) -> Vec<Chunk> {
    documents
        .iter()
        .flat_map(|doc| {
            split_text(&doc.content, params)
                .into_iter()
                .map(|span| make_chunk(&doc.source, span))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Split a single text into overlapping, boundary-aligned spans.
///
/// Returns no spans for empty or whitespace-only text.
pub fn split_text<'a>(text: &'a str, params: &ChunkParams) -> Vec<TextSpan<'a>> {
    let mut spans = Vec::new();
    if text.trim().is_empty() {
        return spans;
    }

    let mut start = 0usize;
    let mut start_char = 0usize;

    loop {
        let window_end = byte_after_chars(text, start, params.chunk_size);
        let end = if window_end >= text.len() {
            text.len()
        } else {
            let min_cut = byte_after_chars(text, start, params.chunk_overlap + 1) - start;
            find_break(&text[start..window_end], min_cut)
                .map(|cut| start + cut)
                .unwrap_or(window_end)
        };

        spans.push(TextSpan {
            start_offset: start_char,
            text: &text[start..end],
        });

        if end >= text.len() {
            break;
        }

        let overlap_start = byte_before_chars(text, end, params.chunk_overlap);
        let next = snap_to_word_start(text, overlap_start, end);
        start_char += text[start..next].chars().count();
        start = next;
    }

    spans
}

/// Best cut inside `window`, measured in bytes from its start.
///
/// Tries paragraph, line, sentence and word boundaries in that order and
/// returns the first whose cut lands at or after `min_cut`.
fn find_break(window: &str, min_cut: usize) -> Option<usize> {
    let paragraph = window.rfind("\n\n").map(|i| i + 2);
    let line = window.rfind('\n').map(|i| i + 1);
    let sentence = window
        .split_sentence_bound_indices()
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .last();
    let word = window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8());

    [paragraph, line, sentence, word]
        .into_iter()
        .flatten()
        .find(|&cut| cut >= min_cut)
}

/// Byte index reached by advancing `n` characters from byte `from`.
fn byte_after_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// Byte index reached by stepping back `n` characters from byte `end`.
fn byte_before_chars(text: &str, end: usize, n: usize) -> usize {
    if n == 0 {
        return end;
    }
    text[..end]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// First word start in `[from, limit)`, or `from` if there is none.
fn snap_to_word_start(text: &str, from: usize, limit: usize) -> usize {
    let mut prev_ws = text[..from]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    for (i, c) in text[from..limit].char_indices() {
        if prev_ws && !c.is_whitespace() {
            return from + i;
        }
        prev_ws = c.is_whitespace();
    }
    from
}

/// Create a [`Chunk`] with a fresh UUID and a SHA-256 content hash.
fn make_chunk(source: &str, span: TextSpan<'_>) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(span.text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        content: span.text.to_string(),
        source: source.to_string(),
        start_offset: span.start_offset,
        knowledge_base: None,
        hash,
    }
}
