//! Core data models.
//!
//! These types flow through ingestion (`Document` → `Chunk`), retrieval
//! (`RetrievalResult`) and prompt assembly (`Message`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Raw text produced by the document loader, one per file or URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content: String,
    /// File path or URL the content came from.
    pub source: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A bounded window of a document's text; the unit of embedding and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Character offset of `content` within the source document.
    pub start_offset: usize,
    /// Owning knowledge base. `None` until the chunk is saved.
    pub knowledge_base: Option<String>,
    /// SHA-256 of `content`.
    pub hash: String,
}

impl Chunk {
    /// Tag the chunk with the knowledge base it is being saved into.
    pub fn in_knowledge_base(mut self, knowledge_base: &str) -> Self {
        self.knowledge_base = Some(knowledge_base.to_string());
        self
    }
}

/// A chunk returned by a query, tagged with the knowledge base it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub content: String,
    pub source: String,
    pub knowledge_base: String,
    /// Provider-defined similarity; higher is better. Missing scores rank last.
    pub relevance_score: Option<f32>,
}

impl RetrievalResult {
    /// Human-readable citation: `"<source> (KB: <knowledge_base>)"`.
    pub fn citation(&self) -> String {
        format!("{} (KB: {})", self.source, self.knowledge_base)
    }
}

/// Who a [`Message`] is from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Image file formats accepted by the chat model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl ImageFormat {
    /// Guess the format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
        }
    }
}

/// Where an image's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ImageData {
    /// Base64-encoded bytes.
    Base64(String),
    /// A file on disk the agent can open itself.
    Path(PathBuf),
}

/// Message payload: plain text or an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    Image { data: ImageData, format: ImageFormat },
}

/// A single chat message with an explicit role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text { text: text.into() },
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn image(role: Role, data: ImageData, format: ImageFormat) -> Self {
        Self {
            role,
            content: Content::Image { data, format },
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.content, Content::Image { .. })
    }

    /// Text content, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            Content::Text { text } => Some(text),
            Content::Image { .. } => None,
        }
    }
}
