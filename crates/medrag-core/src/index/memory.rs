//! In-memory [`VectorIndex`] implementation.
//!
//! Entries live in a `Vec<Arc<IndexEntry>>` behind one `std::sync::RwLock`,
//! so a batch insert is published under a single write guard and readers
//! clone `Arc`s under a read guard. Nearest-neighbor search is brute-force
//! cosine similarity over all entries passing the filters.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{IndexEntry, MetadataPatch, RetrievalFilters};

use super::{IndexSummary, ScoredEntry, VectorIndex};

#[derive(Default)]
struct IndexState {
    dims: Option<usize>,
    entries: Vec<Arc<IndexEntry>>,
    positions: HashMap<String, usize>,
}

impl IndexState {
    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().to_string(), i))
            .collect();
    }
}

/// In-memory vector index.
pub struct InMemoryIndex {
    fixed_dims: Option<usize>,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    /// An index whose dimension is established by the first insert.
    pub fn new() -> Self {
        Self {
            fixed_dims: None,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// An index that only accepts vectors of `dims` components.
    pub fn with_dims(dims: usize) -> Self {
        Self {
            fixed_dims: Some(dims),
            state: RwLock::new(IndexState {
                dims: Some(dims),
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("vector index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("vector index lock poisoned"))
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Check every vector in the batch against `dims` (or against the first
/// vector when no dimension is established). Returns the batch dimension.
fn validate_batch(dims: Option<usize>, entries: &[IndexEntry]) -> Result<Option<usize>> {
    let mut expected = dims;
    for entry in entries {
        let len = entry.vector.len();
        if len == 0 {
            bail!("entry {} has an empty vector", entry.id());
        }
        match expected {
            Some(d) if d != len => bail!(
                "dimension mismatch: index holds {}-d vectors but entry {} has {}",
                d,
                entry.id(),
                len
            ),
            Some(_) => {}
            None => expected = Some(len),
        }
    }
    Ok(expected)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn dims(&self) -> Result<Option<usize>> {
        Ok(self.read()?.dims)
    }

    async fn insert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut state = self.write()?;
        let dims = validate_batch(state.dims, &entries)?;

        let count = entries.len();
        for entry in entries {
            let entry = Arc::new(entry);
            match state.positions.get(entry.id()).copied() {
                Some(pos) => state.entries[pos] = entry,
                None => {
                    let pos = state.entries.len();
                    state.positions.insert(entry.id().to_string(), pos);
                    state.entries.push(entry);
                }
            }
        }
        state.dims = dims;
        Ok(count)
    }

    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<ScoredEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        if let Some(d) = state.dims {
            if d != query.len() {
                bail!(
                    "dimension mismatch: index holds {}-d vectors but query has {}",
                    d,
                    query.len()
                );
            }
        }

        let mut scored: Vec<ScoredEntry> = state
            .entries
            .iter()
            .filter(|e| filters.matches(&e.metadata))
            .map(|e| ScoredEntry {
                score: cosine_similarity(query, &e.vector),
                entry: Arc::clone(e),
            })
            .collect();
        drop(state);

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id().cmp(b.entry.id()))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn entries(&self) -> Result<Vec<Arc<IndexEntry>>> {
        Ok(self.read()?.entries.clone())
    }

    async fn replace_all(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        let dims = validate_batch(self.fixed_dims, &entries)?;
        let count = entries.len();
        let mut next = IndexState {
            dims: dims.or(self.fixed_dims),
            entries: entries.into_iter().map(Arc::new).collect(),
            positions: HashMap::new(),
        };
        next.reindex();

        *self.write()? = next;
        Ok(count)
    }

    async fn replace_document(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
        if let Some(stray) = entries.iter().find(|e| e.document_id() != document_id) {
            bail!(
                "entry {} belongs to document {}, not {}",
                stray.id(),
                stray.document_id(),
                document_id
            );
        }

        let mut state = self.write()?;
        let dims = validate_batch(state.dims, &entries)?;
        let incoming: HashSet<&str> = entries.iter().map(|e| e.id()).collect();
        state
            .entries
            .retain(|e| e.document_id() != document_id && !incoming.contains(e.id()));
        drop(incoming);

        let count = entries.len();
        state.entries.extend(entries.into_iter().map(Arc::new));
        state.reindex();
        state.dims = dims;
        Ok(count)
    }

    async fn update_metadata(&self, document_id: &str, patch: &MetadataPatch) -> Result<usize> {
        let mut state = self.write()?;
        let mut updated = 0;
        for slot in state.entries.iter_mut().filter(|e| e.document_id() == document_id) {
            let mut entry = IndexEntry::clone(&**slot);
            entry.metadata = patch.apply(&slot.metadata);
            *slot = Arc::new(entry);
            updated += 1;
        }
        Ok(updated)
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.entries.len();
        state.entries.retain(|e| e.document_id() != document_id);
        let removed = before - state.entries.len();
        if removed > 0 {
            state.reindex();
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    async fn summary(&self) -> Result<IndexSummary> {
        let state = self.read()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        let mut sources: BTreeMap<String, usize> = BTreeMap::new();

        for entry in &state.entries {
            if !seen.insert(entry.document_id()) {
                continue;
            }
            if let Some(c) = &entry.metadata.category {
                *categories.entry(c.clone()).or_insert(0) += 1;
            }
            if let Some(s) = &entry.metadata.source {
                *sources.entry(s.clone()).or_insert(0) += 1;
            }
        }

        Ok(IndexSummary {
            entries: state.entries.len(),
            documents: seen.len(),
            categories,
            sources,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        *state = IndexState {
            dims: self.fixed_dims,
            ..Default::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, EntryMetadata};

    fn entry(id: &str, doc: &str, vector: Vec<f32>, category: Option<&str>) -> IndexEntry {
        IndexEntry::new(
            Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                chunk_index: 0,
                total_chunks: 1,
                section: None,
                content: format!("content of {}", id),
                length: 0,
                hash: String::new(),
            },
            vector,
            EntryMetadata {
                category: category.map(String::from),
                source: Some("kb".to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_nearest_order() {
        let index = InMemoryIndex::new();
        index
            .insert(vec![
                entry("a", "d1", vec![1.0, 0.0], None),
                entry("b", "d2", vec![0.0, 1.0], None),
                entry("c", "d3", vec![0.7, 0.7], None),
            ])
            .await
            .unwrap();

        let hits = index
            .nearest(&[1.0, 0.0], 2, &RetrievalFilters::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(index.dims().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejects_whole_batch() {
        let index = InMemoryIndex::with_dims(2);
        let err = index
            .insert(vec![
                entry("a", "d1", vec![1.0, 0.0], None),
                entry("b", "d1", vec![1.0, 0.0, 0.0], None),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_by_id() {
        let index = InMemoryIndex::new();
        index.insert(vec![entry("a", "d1", vec![1.0, 0.0], None)]).await.unwrap();
        index.insert(vec![entry("a", "d1", vec![0.0, 1.0], None)]).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        let hits = index
            .nearest(&[0.0, 1.0], 5, &RetrievalFilters::default())
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_filters_and_remove_document() {
        let index = InMemoryIndex::new();
        index
            .insert(vec![
                entry("a", "d1", vec![1.0, 0.0], Some("disease")),
                entry("b", "d1", vec![0.9, 0.1], Some("disease")),
                entry("c", "d2", vec![1.0, 0.0], Some("drug")),
            ])
            .await
            .unwrap();

        let filters = RetrievalFilters {
            category: Some("drug".into()),
            ..Default::default()
        };
        let hits = index.nearest(&[1.0, 0.0], 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id(), "c");

        let summary = index.summary().await.unwrap();
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.categories.get("disease"), Some(&1));

        assert_eq!(index.remove_document("d1").await.unwrap(), 2);
        assert_eq!(index.len().await.unwrap(), 1);
        let hits = index
            .nearest(&[1.0, 0.0], 10, &RetrievalFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].entry.id(), "c");
    }

    #[tokio::test]
    async fn test_replace_document_swaps_under_one_write() {
        let index = InMemoryIndex::with_dims(2);
        index
            .insert(vec![
                entry("d1#0", "d1", vec![1.0, 0.0], None),
                entry("d1#1", "d1", vec![0.9, 0.1], None),
                entry("d1#2", "d1", vec![0.8, 0.2], None),
                entry("d2#0", "d2", vec![0.0, 1.0], None),
            ])
            .await
            .unwrap();

        let n = index
            .replace_document("d1", vec![entry("d1#0", "d1", vec![0.0, 1.0], Some("drug"))])
            .await
            .unwrap();
        assert_eq!(n, 1);
        let ids: Vec<String> = index
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["d2#0", "d1#0"]);

        // A rejected batch leaves the old entries in place.
        let err = index
            .replace_document("d1", vec![entry("d1#0", "d1", vec![1.0, 0.0, 0.0], None)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        let err = index
            .replace_document("d1", vec![entry("x", "d3", vec![1.0, 0.0], None)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("belongs to document d3"));
        assert_eq!(index.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_readers_never_see_document_missing_during_replace() {
        let index = Arc::new(InMemoryIndex::with_dims(2));
        let batch = |round: usize| -> Vec<IndexEntry> {
            (0..3)
                .map(|j| entry(&format!("d1#{}", j), "d1", vec![1.0, (round + j) as f32], None))
                .collect()
        };
        index.insert(batch(0)).await.unwrap();

        let writer = {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                for round in 1..200 {
                    index.replace_document("d1", batch(round)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let reader = {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                for _ in 0..500 {
                    assert_eq!(index.len().await.unwrap(), 3);
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_update_metadata_patches_every_entry() {
        let index = InMemoryIndex::new();
        index
            .insert(vec![
                entry("a", "d1", vec![1.0, 0.0], Some("disease")),
                entry("b", "d1", vec![0.9, 0.1], Some("disease")),
                entry("c", "d2", vec![1.0, 0.0], Some("disease")),
            ])
            .await
            .unwrap();

        let patch = MetadataPatch {
            category: Some("drug".into()),
            tags: Some(vec!["reviewed".into()]),
            ..Default::default()
        };
        assert_eq!(index.update_metadata("d1", &patch).await.unwrap(), 2);
        assert_eq!(index.update_metadata("missing", &patch).await.unwrap(), 0);

        let filters = RetrievalFilters {
            category: Some("drug".into()),
            ..Default::default()
        };
        let hits = index.nearest(&[1.0, 0.0], 10, &filters).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[0].entry.metadata.tags, vec!["reviewed".to_string()]);
        assert_eq!(hits[0].entry.metadata.source.as_deref(), Some("kb"));
        assert_eq!(hits[0].entry.vector, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_clear_keeps_fixed_dims() {
        let index = InMemoryIndex::with_dims(2);
        index.insert(vec![entry("a", "d1", vec![1.0, 0.0], None)]).await.unwrap();
        index.clear().await.unwrap();
        assert_eq!(index.len().await.unwrap(), 0);
        assert_eq!(index.dims().await.unwrap(), Some(2));

        let open = InMemoryIndex::new();
        open.insert(vec![entry("a", "d1", vec![1.0, 0.0, 0.0], None)]).await.unwrap();
        open.clear().await.unwrap();
        assert_eq!(open.dims().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_all_swaps_contents() {
        let index = InMemoryIndex::new();
        index.insert(vec![entry("a", "d1", vec![1.0, 0.0], None)]).await.unwrap();
        index
            .replace_all(vec![
                entry("x", "d9", vec![0.0, 1.0], None),
                entry("y", "d9", vec![1.0, 1.0], None),
            ])
            .await
            .unwrap();
        let ids: Vec<String> = index
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_and_reads() {
        let index = Arc::new(InMemoryIndex::with_dims(2));
        let mut handles = Vec::new();
        for i in 0..8 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move {
                let batch = (0..10)
                    .map(|j| entry(&format!("e{}-{}", i, j), &format!("d{}", i), vec![1.0, j as f32], None))
                    .collect();
                index.insert(batch).await.unwrap();
                let n = index.len().await.unwrap();
                assert_eq!(n % 10, 0, "reader observed a partial batch");
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(index.len().await.unwrap(), 80);
    }
}
