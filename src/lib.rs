//! # askbase — retrieval-augmented question answering
//!
//! Stores text fragments as vector embeddings and answers questions by
//! retrieving the most similar fragments and grounding a language model's
//! reply on them.
//!
//! ## Architecture
//!
//! - **[`embedder`]** — text to vector via a remote OpenAI-compatible service
//! - **[`db`]** — SQLite + sqlite-vec knowledge store (insert, cosine search)
//! - **[`context`]** — retrieved chunks to one prompt context
//! - **[`generator`]** — chat completions, blocking or streamed
//! - **[`rag`]** — ingestion and query pipelines
//! - **[`server`]** — HTTP endpoints (axum, SSE for streamed chat)
//! - **[`mcp`]** — MCP tools over stdio (rmcp)
//! - **[`config`]** — JSON configuration with per-field defaults

pub mod config;
pub mod context;
pub mod db;
pub mod embedder;
pub mod error;
pub mod generator;
pub mod mcp;
pub mod rag;
pub mod server;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
