//! # kb-assist
//!
//! A knowledge-base retrieval layer for a conversational agent.
//!
//! Documents and URLs are staged per topic ("knowledge base"), split into
//! overlapping chunks, embedded and stored in one SQLite file per knowledge
//! base. At question time the selected knowledge bases are searched, the
//! hits are merged by relevance and the best of them are prepended to the
//! query as context. Inputs that look like commands ("what's on my screen",
//! an image path) bypass retrieval entirely.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │ docs/ urls   │──▶│ Load + Chunk │──▶│ <store_root>/<kb>/   │
//! │ per kb       │   │ + Embed      │   │ store.sqlite         │
//! └──────────────┘   └──────────────┘   └──────────┬──────────┘
//!                                                  │
//!       input ──▶ CommandMatcher ──(no match)──▶ ContextRetriever
//!                      │                           │
//!                      └──(image)──▶ ChatModel ◀───┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and saving |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`layout`] | On-disk paths for knowledge bases and stores |
//! | [`extract`] | Text extraction from HTML, PDF and OOXML |
//! | [`loader`] | Local file and URL loading |
//! | [`http`] | Provider HTTP retries and errors |
//! | [`embedding`] | Embedding provider implementations |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Per-knowledge-base vector store |
//! | [`manager`] | Staging sources and building knowledge bases |
//! | [`retrieve`] | Multi-knowledge-base context retrieval |
//! | [`commands`] | Command matcher |
//! | [`llm`] | Streaming chat-model providers |
//! | [`prompt`] | System and user prompt assembly |
//! | [`session`] | Selected knowledge bases with their skills |
//! | [`chat`] | One full chat turn |
//! | [`worker`] | Background job queue |
//! | [`app`] | Component wiring for the CLI |

pub mod app;
pub mod chat;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod layout;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod manager;
pub mod migrate;
pub mod prompt;
pub mod retrieve;
pub mod session;
pub mod sqlite_store;
pub mod worker;
