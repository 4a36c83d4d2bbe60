//! Error taxonomy for the medical RAG pipeline.
//!
//! Only configuration-time failures reach callers of the query operations;
//! every other variant is logged and converted into a degraded result
//! (zero vector, empty digest, canned answer) at the component boundary.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid configuration, or no embedding provider could be loaded.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The embedder produced no usable vector.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The generator did not finish before its deadline.
    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    /// The generator failed after all retries.
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    /// One document of an ingestion batch could not be indexed.
    #[error("Ingestion failed for document {document_id}: {reason}")]
    IngestionPartialFailure { document_id: String, reason: String },

    /// The vector index rejected an operation.
    #[error("Vector index error: {0:#}")]
    Index(#[source] anyhow::Error),

    /// Snapshot database failure.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
