//! # kb-assist core
//!
//! Shared, I/O-free logic for kb-assist: data models, the recursive
//! chunker, the embedding provider trait, the knowledge store abstraction,
//! and the ranking algorithms used by retrieval (similarity top-k, MMR,
//! cross-knowledge-base merge and relevance thresholding).
//!
//! This crate contains no tokio, sqlx, filesystem or network access. The
//! `kb-assist` app crate supplies concrete stores and providers.

pub mod chunk;
pub mod embedding;
pub mod models;
pub mod search;
pub mod store;
