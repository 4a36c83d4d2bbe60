//! Retrieval engine with semantic, hybrid, and rerank strategies.
//!
//! The engine operates entirely through the [`VectorIndex`] trait. The
//! caller embeds the query and passes both the vector and the raw text.
//!
//! # Scoring
//!
//! 1. Fetch `2 × top_k` (semantic, hybrid) or `3 × top_k` (rerank) nearest
//!    candidates that pass the metadata filters.
//! 2. Semantic: score = cosine similarity.
//!    Hybrid/rerank: score = `semantic_weight × cosine + lexical_weight × lexical`,
//!    where lexical is the weighted fraction of query terms found in the
//!    entry's title, content, and tags.
//! 3. Drop results below `similarity_threshold`.
//! 4. Sort by score (desc), entry ID (asc).
//! 5. Deduplicate by entry (or by document when grouping by document),
//!    keeping the highest-scoring occurrence.
//! 6. Truncate to `top_k` and assign 1-based ranks.
//!
//! Because the threshold only removes a suffix of the sorted candidate
//! list, raising it always yields a prefix of the lower-threshold result.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::embedding::lexical_terms;
use crate::index::VectorIndex;
use crate::models::{IndexEntry, RetrievalFilters, RetrievalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    #[default]
    Semantic,
    Hybrid,
    Rerank,
}

impl RetrievalStrategy {
    /// How many candidates to fetch per requested result.
    pub fn candidate_multiplier(self) -> usize {
        match self {
            Self::Semantic | Self::Hybrid => 2,
            Self::Rerank => 3,
        }
    }
}

impl FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            "rerank" => Ok(Self::Rerank),
            other => Err(format!(
                "Unknown retrieval strategy: '{}'. Use semantic, hybrid, or rerank.",
                other
            )),
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
            Self::Rerank => "rerank",
        })
    }
}

/// Deduplication key for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// One result per index entry.
    #[default]
    Chunk,
    /// One result per document, its best chunk.
    Document,
}

/// Linear blend weights for hybrid and rerank scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub semantic: f32,
    pub lexical: f32,
    pub title: f32,
    pub content: f32,
    pub tags: f32,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            lexical: 0.3,
            title: 0.5,
            content: 0.3,
            tags: 0.2,
        }
    }
}

/// All inputs for a single retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query_vec: &'a [f32],
    pub query_text: &'a str,
    pub top_k: usize,
    pub strategy: RetrievalStrategy,
    pub similarity_threshold: f32,
    pub filters: &'a RetrievalFilters,
}

/// Ranks index entries against a query.
#[derive(Clone)]
pub struct RetrievalEngine {
    index: Arc<dyn VectorIndex>,
    weights: BlendWeights,
    group_by: GroupBy,
}

impl RetrievalEngine {
    pub fn new(index: Arc<dyn VectorIndex>, weights: BlendWeights, group_by: GroupBy) -> Self {
        Self {
            index,
            weights,
            group_by,
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn weights(&self) -> BlendWeights {
        self.weights
    }

    /// Run one retrieval. An empty index or an all-filtered candidate set
    /// yields an empty vector, not an error.
    pub async fn retrieve(&self, req: &RetrievalRequest<'_>) -> Result<Vec<RetrievalResult>> {
        if req.top_k == 0 {
            return Ok(Vec::new());
        }

        let limit = req.top_k.saturating_mul(req.strategy.candidate_multiplier());
        let candidates = self.index.nearest(req.query_vec, limit, req.filters).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let terms = match req.strategy {
            RetrievalStrategy::Semantic => Vec::new(),
            RetrievalStrategy::Hybrid | RetrievalStrategy::Rerank => distinct_terms(req.query_text),
        };

        let scored = candidates
            .into_iter()
            .map(|c| match req.strategy {
                RetrievalStrategy::Semantic => RetrievalResult {
                    entry: c.entry,
                    score: c.score,
                    semantic_score: c.score,
                    lexical_score: None,
                    rank: 0,
                },
                RetrievalStrategy::Hybrid | RetrievalStrategy::Rerank => {
                    let lexical = lexical_score(&terms, &c.entry, &self.weights);
                    RetrievalResult {
                        score: self.weights.semantic * c.score + self.weights.lexical * lexical,
                        entry: c.entry,
                        semantic_score: c.score,
                        lexical_score: Some(lexical),
                        rank: 0,
                    }
                }
            })
            .collect();

        Ok(finalize(scored, req.similarity_threshold, req.top_k, self.group_by))
    }

    /// Keyword search: score is the fraction of whitespace-separated query
    /// keywords found (case-insensitively) in the entry's title, content,
    /// or tags. Entries matching no keyword are omitted.
    pub async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievalResult>> {
        let keywords: Vec<String> = query
            .split_whitespace()
            .map(|k| k.to_lowercase())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if keywords.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let scored = self
            .index
            .entries()
            .await?
            .into_iter()
            .filter(|e| filters.matches(&e.metadata))
            .filter_map(|entry| {
                let haystack = searchable_text(&entry).to_lowercase();
                let hits = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
                if hits == 0 {
                    return None;
                }
                let score = hits as f32 / keywords.len() as f32;
                Some(RetrievalResult {
                    entry,
                    score,
                    semantic_score: 0.0,
                    lexical_score: Some(score),
                    rank: 0,
                })
            })
            .collect();

        Ok(finalize(scored, f32::NEG_INFINITY, top_k, self.group_by))
    }

    /// Every entry passing `filters`, in insertion order.
    pub async fn entries_matching(&self, filters: &RetrievalFilters) -> Result<Vec<Arc<IndexEntry>>> {
        Ok(self
            .index
            .entries()
            .await?
            .into_iter()
            .filter(|e| filters.matches(&e.metadata))
            .collect())
    }
}

/// Threshold, sort, dedup, truncate, and rank.
pub fn finalize(
    mut results: Vec<RetrievalResult>,
    threshold: f32,
    top_k: usize,
    group_by: GroupBy,
) -> Vec<RetrievalResult> {
    results.retain(|r| r.score >= threshold);
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.id().cmp(b.entry.id()))
    });

    let mut seen: HashSet<String> = HashSet::new();
    results.retain(|r| {
        let key = match group_by {
            GroupBy::Chunk => r.entry.id(),
            GroupBy::Document => r.entry.document_id(),
        };
        seen.insert(key.to_string())
    });

    results.truncate(top_k);
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    results
}

fn distinct_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    lexical_terms(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn searchable_text(entry: &IndexEntry) -> String {
    let mut text = String::new();
    if let Some(title) = &entry.metadata.title {
        text.push_str(title);
        text.push('\n');
    }
    text.push_str(&entry.chunk.content);
    for tag in &entry.metadata.tags {
        text.push('\n');
        text.push_str(tag);
    }
    text
}

/// Weighted fraction of `terms` present in the entry's title, content, and
/// tags, in `[0, 1]`.
pub fn lexical_score(terms: &[String], entry: &IndexEntry, weights: &BlendWeights) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }

    let overlap = |text: &str| -> f32 {
        let field: HashSet<String> = lexical_terms(text).into_iter().collect();
        if field.is_empty() {
            return 0.0;
        }
        terms.iter().filter(|t| field.contains(*t)).count() as f32 / terms.len() as f32
    };

    let title = entry.metadata.title.as_deref().map(overlap).unwrap_or(0.0);
    let content = overlap(&entry.chunk.content);
    let tags = overlap(&entry.metadata.tags.join(" "));

    let total = weights.title + weights.content + weights.tags;
    if total <= 0.0 {
        return 0.0;
    }
    (weights.title * title + weights.content * content + weights.tags * tags) / total
}
