//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines the storage operations the retrieval
//! engine and pipeline need: atomic batch insert, nearest-neighbor query,
//! snapshotting, and removal. Implementations must be `Send + Sync`; the
//! index is the only component mutated by more than one logical operation.
//!
//! # Consistency
//!
//! An [`insert`](VectorIndex::insert) either publishes every entry of the
//! batch or none of them. Concurrent readers observe the index before or
//! after the batch, never a partially written entry. The same holds for
//! [`replace_document`](VectorIndex::replace_document): a reader sees the
//! document's old entries or its new ones, never neither.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::{IndexEntry, MetadataPatch, RetrievalFilters};

/// An entry paired with its raw cosine similarity to a query vector.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: Arc<IndexEntry>,
    pub score: f32,
}

/// Aggregate counts over the indexed entries.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct IndexSummary {
    pub entries: usize,
    pub documents: usize,
    pub categories: BTreeMap<String, usize>,
    pub sources: BTreeMap<String, usize>,
}

/// Abstract vector index backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](VectorIndex::insert) | Publish a batch of entries (upsert by entry ID) |
/// | [`nearest`](VectorIndex::nearest) | Cosine nearest neighbors with metadata filters |
/// | [`entries`](VectorIndex::entries) | Consistent snapshot of all entries |
/// | [`replace_all`](VectorIndex::replace_all) | Swap the whole contents (used by snapshot load) |
/// | [`replace_document`](VectorIndex::replace_document) | Swap one document's entries (re-ingest) |
/// | [`update_metadata`](VectorIndex::update_metadata) | Patch the metadata of one document's entries |
/// | [`remove_document`](VectorIndex::remove_document) | Delete every entry of one document |
/// | [`clear`](VectorIndex::clear) | Remove all entries |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Fixed vector dimension, if one has been established.
    async fn dims(&self) -> Result<Option<usize>>;

    /// Insert a batch of entries. Rejects the whole batch when any vector
    /// does not match the index dimension. Returns the number inserted.
    async fn insert(&self, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Return up to `limit` entries passing `filters`, sorted by cosine
    /// similarity descending (ties broken by entry ID ascending).
    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<ScoredEntry>>;

    /// Snapshot of every entry in insertion order.
    async fn entries(&self) -> Result<Vec<Arc<IndexEntry>>>;

    /// Atomically replace the contents with `entries`.
    async fn replace_all(&self, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Replace every entry of `document_id` with `entries` under one write.
    /// The batch is validated first; a rejected batch leaves the old
    /// entries in place. Returns the number inserted.
    async fn replace_document(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Apply `patch` to the metadata of every entry of `document_id` under
    /// one write. Returns the number of entries updated.
    async fn update_metadata(&self, document_id: &str, patch: &MetadataPatch) -> Result<usize>;

    /// Remove every entry belonging to `document_id`. Returns the count removed.
    async fn remove_document(&self, document_id: &str) -> Result<usize>;

    /// Number of entries.
    async fn len(&self) -> Result<usize>;

    /// Entry and document counts broken down by category and source.
    async fn summary(&self) -> Result<IndexSummary>;

    /// Remove all entries. A dimension fixed at construction is kept.
    async fn clear(&self) -> Result<()>;
}
