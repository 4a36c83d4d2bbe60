//! Core data models shared by the chunker, index, and retrieval engine.
//!
//! These types represent the documents, chunks, index entries, and
//! retrieval results that flow through ingestion and query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Free-form document metadata.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// What a document's payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    #[default]
    Text,
    Image,
}

/// A knowledge-base document accepted for indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub kind: DocumentKind,
    /// Path of the image payload for [`DocumentKind::Image`] documents.
    #[serde(default)]
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Content-addressed ID for documents supplied without one.
    pub fn derived_id(title: Option<&str>, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(title.unwrap_or_default().as_bytes());
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A contiguous piece of a document produced by the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID (v5) derived from the document ID and index.
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Section label assigned by structured splitting.
    pub section: Option<String>,
    pub content: String,
    /// Length of `content` in characters.
    pub length: usize,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
}

/// The document fields copied onto every index entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub title: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extra: Metadata,
    #[serde(default)]
    pub kind: DocumentKind,
    pub created_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            title: doc.title.clone(),
            source: doc.source.clone(),
            category: doc.category.clone(),
            tags: doc.tags.clone(),
            extra: doc.metadata.clone(),
            kind: doc.kind,
            created_at: Some(doc.created_at),
        }
    }
}

/// Partial update of a document's indexed metadata.
///
/// `None` fields keep their current value; `extra` keys are merged over
/// the existing map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub extra: Metadata,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.source.is_none()
            && self.category.is_none()
            && self.tags.is_none()
            && self.extra.is_empty()
    }

    pub fn apply(&self, base: &EntryMetadata) -> EntryMetadata {
        let mut out = base.clone();
        if let Some(title) = &self.title {
            out.title = Some(title.clone());
        }
        if let Some(source) = &self.source {
            out.source = Some(source.clone());
        }
        if let Some(category) = &self.category {
            out.category = Some(category.clone());
        }
        if let Some(tags) = &self.tags {
            out.tags = tags.clone();
        }
        for (k, v) in &self.extra {
            out.extra.insert(k.clone(), v.clone());
        }
        out
    }
}

/// One chunk paired with its vector, owned by a vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

impl IndexEntry {
    pub fn new(chunk: Chunk, vector: Vec<f32>, metadata: EntryMetadata) -> Self {
        Self {
            chunk,
            vector,
            metadata,
        }
    }

    /// Entry identity (the chunk ID).
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

/// Exact-match metadata restrictions applied before scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    pub category: Option<String>,
    pub source: Option<String>,
    /// Matches when the entry carries any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RetrievalFilters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.source.is_none() && self.tags.is_empty()
    }

    pub fn matches(&self, meta: &EntryMetadata) -> bool {
        if let Some(category) = &self.category {
            if meta.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if meta.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| meta.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// A ranked hit returned by the retrieval engine.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub entry: Arc<IndexEntry>,
    /// Final score used for ranking and threshold filtering.
    pub score: f32,
    /// Cosine similarity between the query and entry vectors.
    pub semantic_score: f32,
    /// Lexical overlap score, when the strategy computed one.
    pub lexical_score: Option<f32>,
    /// 1-based position in the result list.
    pub rank: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(category: Option<&str>, source: Option<&str>, tags: &[&str]) -> EntryMetadata {
        EntryMetadata {
            category: category.map(String::from),
            source: source.map(String::from),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = RetrievalFilters::default();
        assert!(filters.is_empty());
        assert!(filters.matches(&meta(None, None, &[])));
    }

    #[test]
    fn test_category_and_source_exact() {
        let filters = RetrievalFilters {
            category: Some("disease".into()),
            source: Some("textbook".into()),
            tags: vec![],
        };
        assert!(filters.matches(&meta(Some("disease"), Some("textbook"), &[])));
        assert!(!filters.matches(&meta(Some("drug"), Some("textbook"), &[])));
        assert!(!filters.matches(&meta(Some("disease"), None, &[])));
    }

    #[test]
    fn test_tags_any_membership() {
        let filters = RetrievalFilters {
            tags: vec!["心血管".into(), "慢病".into()],
            ..Default::default()
        };
        assert!(filters.matches(&meta(None, None, &["慢病"])));
        assert!(!filters.matches(&meta(None, None, &["呼吸"])));
    }

    #[test]
    fn test_derived_id_is_stable() {
        let a = Document::derived_id(Some("高血压"), "内容");
        assert_eq!(a, Document::derived_id(Some("高血压"), "内容"));
        assert_ne!(a, Document::derived_id(None, "内容"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_document_kind_serde() {
        let kind: DocumentKind = serde_json::from_str("\"image\"").unwrap();
        assert_eq!(kind, DocumentKind::Image);
        assert_eq!(serde_json::to_string(&DocumentKind::Text).unwrap(), "\"text\"");
    }
}
