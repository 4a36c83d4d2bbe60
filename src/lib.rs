//! # Medical RAG
//!
//! Retrieval-augmented question answering over a medical knowledge base.
//!
//! Documents are chunked, embedded, and held in an in-memory vector index.
//! A question is embedded, matched against the index, the best passages are
//! condensed into a short digest, and a text-generation backend answers
//! from that digest. Every stage degrades instead of failing: no embedding
//! model falls back to a lexical vectorizer, no results use a no-context
//! prompt, and a slow or broken generator yields a fixed apology.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │ Chunker  │──▶│ Embedder │──▶│ VectorIndex │
//! └──────────┘   └──────────┘   └──────┬──────┘
//!                                      │
//!                 ┌────────────────────┤
//!                 ▼                    ▼
//!          ┌────────────┐       ┌───────────┐       ┌───────────┐
//!          │ Retrieval  │──────▶│ Summarizer│──────▶│ Generator │
//!          └────────────┘       └───────────┘       └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`embedding`] | Provider fallback chain, batching, normalization |
//! | [`generation`] | Prompt templates, deadlines, retries, streaming |
//! | [`summarize`] | Digest of retrieved passages |
//! | [`pipeline`] | Ingestion and query orchestration |
//! | [`snapshot`] | SQLite save/load of the index |
//! | [`loader`] | JSON / JSONL / directory corpus loading |
//! | [`error`] | Error taxonomy |

pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod snapshot;
pub mod summarize;

pub use error::{RagError, Result};
pub use pipeline::{Pipeline, PipelineResult, QueryOptions};
