//! The RAG pipeline: ingestion and question answering.
//!
//! A [`Pipeline`] is built once from a [`Config`] and cloned freely; every
//! handle inside it is shared. Ingestion runs chunk → embed → index per
//! document. A query runs:
//!
//! ```text
//! received → query_embedded → retrieved → summarized → context_built → generating → done
//!                                   └──── (no results) ───────┘
//! ```
//!
//! Query operations never fail: index errors and generation problems turn
//! into canned answers with `degraded = true`. Only construction
//! ([`Pipeline::from_config`]) and the snapshot/admin operations return
//! errors.

pub mod stage;
pub mod stream;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use medrag_core::chunk::{whole_document_chunk, Chunker};
use medrag_core::embedding::is_zero_vector;
use medrag_core::index::memory::InMemoryIndex;
use medrag_core::index::VectorIndex;
use medrag_core::models::{
    Document, DocumentKind, EntryMetadata, IndexEntry, MetadataPatch, RetrievalFilters,
    RetrievalResult,
};
use medrag_core::retrieval::{RetrievalEngine, RetrievalRequest, RetrievalStrategy};

use crate::config::Config;
use crate::embedding::{Embedder, EmbedderStats};
use crate::error::{RagError, Result};
use crate::generation::prompt::{
    build_context, chat_prompt, fit_prompt, medical_prompt, no_context_prompt, ChatTurn,
    ResponseType,
};
use crate::generation::{
    GenerationOutcome, Generated, Generator, EMPTY_CHAT_MESSAGE, PIPELINE_ERROR_MESSAGE,
};
use crate::snapshot::{self, SnapshotMeta, CONFIG_FILE};
use crate::summarize::Summarizer;

pub use stage::{QueryStage, StageTracker};
pub use stream::StreamEvent;

/// Per-query overrides. Unset fields use the `[retrieval]` configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub response_type: ResponseType,
    pub similarity_threshold: Option<f32>,
    pub strategy: Option<RetrievalStrategy>,
    pub filters: RetrievalFilters,
}

/// A retrieved chunk as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub content: String,
    pub source: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub section: Option<String>,
    pub chunk_index: usize,
    pub score: f32,
    pub semantic_score: f32,
    pub lexical_score: Option<f32>,
    pub rank: usize,
}

impl From<&RetrievalResult> for RetrievedDocument {
    fn from(r: &RetrievalResult) -> Self {
        let entry = &r.entry;
        Self {
            id: entry.id().to_string(),
            document_id: entry.document_id().to_string(),
            title: entry.metadata.title.clone(),
            content: entry.chunk.content.clone(),
            source: entry.metadata.source.clone(),
            category: entry.metadata.category.clone(),
            tags: entry.metadata.tags.clone(),
            section: entry.chunk.section.clone(),
            chunk_index: entry.chunk.chunk_index,
            score: r.score,
            semantic_score: r.semantic_score,
            lexical_score: r.lexical_score,
            rank: r.rank,
        }
    }
}

fn to_documents(results: &[RetrievalResult]) -> Vec<RetrievedDocument> {
    results.iter().map(RetrievedDocument::from).collect()
}

/// Fold entries into one summary per document, in first-seen order.
fn group_documents(entries: &[Arc<IndexEntry>]) -> Vec<DocumentSummary> {
    let mut docs: Vec<DocumentSummary> = Vec::new();
    for entry in entries {
        match docs.iter_mut().find(|d| d.document_id == entry.document_id()) {
            Some(doc) => doc.chunks += 1,
            None => docs.push(DocumentSummary {
                document_id: entry.document_id().to_string(),
                title: entry.metadata.title.clone(),
                source: entry.metadata.source.clone(),
                category: entry.metadata.category.clone(),
                tags: entry.metadata.tags.clone(),
                chunks: 1,
            }),
        }
    }
    docs
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub question: String,
    pub answer: String,
    pub context: String,
    pub retrieved_documents: Vec<RetrievedDocument>,
    pub response_type: ResponseType,
    pub timestamp: DateTime<Utc>,
    /// True when the answer is not grounded in a generated response over
    /// retrieved context (no results, fallback digest, or canned text).
    pub degraded: bool,
    pub generation: GenerationOutcome,
    /// Last stage the query reached.
    pub stage: QueryStage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestFailure {
    /// Position of the document in the input batch.
    pub index: usize,
    pub document_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub accepted_count: usize,
    pub chunk_count: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub context: String,
    pub retrieved_documents: Vec<RetrievedDocument>,
    pub degraded: bool,
    pub generation: GenerationOutcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub index_size: usize,
    pub document_count: usize,
    pub embedder: EmbedderStats,
    pub strategy: RetrievalStrategy,
    pub similarity_threshold: f32,
    pub generator: String,
    pub categories: BTreeMap<String, usize>,
    pub sources: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

/// One indexed document, reconstructed from its entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
}

impl std::str::FromStr for SearchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "Unknown search type: '{}'. Use semantic, keyword, or hybrid.",
                other
            )),
        }
    }
}

fn advance(tracker: &mut StageTracker, next: QueryStage) {
    if let Err(e) = tracker.advance(next) {
        warn!(error = %e, "stage tracking");
    }
}

/// Answer prompt plus the material it was built from.
struct PreparedAnswer {
    retrieved: Vec<RetrievalResult>,
    context: String,
    prompt: String,
    digest_degraded: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    chunker: Arc<Chunker>,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    engine: RetrievalEngine,
    summarizer: Summarizer,
    generator: Generator,
}

impl Pipeline {
    /// Validate `config`, load the embedder and generator, and create an
    /// empty index sized to the embedder.
    ///
    /// # Errors
    ///
    /// [`RagError::Configuration`] for invalid configuration or when no
    /// embedding provider loads.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = Embedder::from_config(&config.embedding).await?;
        let generator = Generator::from_config(&config.generation)?;
        Ok(Self::with_components(config, embedder, generator))
    }

    /// Assemble a pipeline around already-built components.
    pub fn with_components(config: Config, embedder: Embedder, generator: Generator) -> Self {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::with_dims(embedder.dims()));
        let engine = RetrievalEngine::new(
            index.clone(),
            config.retrieval.weights(),
            config.retrieval.group_by,
        );
        let summarizer = Summarizer::new(generator.clone(), config.summarization.clone());
        Self {
            chunker: Arc::new(Chunker::new(config.chunking.to_chunker_config())),
            config: Arc::new(config),
            embedder,
            index,
            engine,
            summarizer,
            generator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    // ============ Ingestion ============

    /// Chunk, embed, and index `documents`. A failing document is reported
    /// in [`IngestReport::failures`] and the rest of the batch continues.
    /// Re-ingesting a document ID replaces its previous entries.
    pub async fn add_documents(&self, documents: Vec<Document>, vectorize_images: bool) -> IngestReport {
        let mut report = IngestReport::default();
        let total = documents.len();

        for (index, mut doc) in documents.into_iter().enumerate() {
            if doc.id.trim().is_empty() {
                doc.id = Document::derived_id(doc.title.as_deref(), &doc.content);
            }
            match self.ingest_one(&doc, vectorize_images).await {
                Ok(chunks) => {
                    report.accepted_count += 1;
                    report.chunk_count += chunks;
                }
                Err(e) => {
                    warn!(document_id = %doc.id, error = %e, "document skipped");
                    report.failures.push(IngestFailure {
                        index,
                        document_id: doc.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            documents = total,
            accepted = report.accepted_count,
            chunks = report.chunk_count,
            failed = report.failures.len(),
            "ingestion finished"
        );
        report
    }

    async fn ingest_one(&self, doc: &Document, vectorize_images: bool) -> Result<usize> {
        let fail = |reason: &str| RagError::IngestionPartialFailure {
            document_id: doc.id.clone(),
            reason: reason.to_string(),
        };
        let metadata = EntryMetadata::from_document(doc);

        let entries = if doc.kind == DocumentKind::Image && vectorize_images {
            let path = doc
                .image_path
                .as_deref()
                .ok_or_else(|| fail("image document has no image_path"))?;
            let vector = self.embedder.embed_image(Path::new(path)).await;
            if is_zero_vector(&vector) {
                return Err(fail("image embedding unavailable"));
            }
            let caption = match doc.content.trim() {
                "" => doc.title.clone().unwrap_or_else(|| path.to_string()),
                text => text.to_string(),
            };
            vec![IndexEntry::new(whole_document_chunk(&doc.id, &caption), vector, metadata)]
        } else {
            let chunks = self.chunker.chunk(&doc.id, &doc.content);
            if chunks.is_empty() {
                return Err(fail("document has no content"));
            }
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await;
            if vectors.iter().any(|v| is_zero_vector(v)) {
                return Err(fail("embedding unavailable"));
            }
            chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexEntry::new(chunk, vector, metadata.clone()))
                .collect::<Vec<_>>()
        };

        let inserted = self
            .index
            .replace_document(&doc.id, entries)
            .await
            .map_err(|e| fail(&format!("{:#}", e)))?;
        debug!(document_id = %doc.id, chunks = inserted, "document indexed");
        Ok(inserted)
    }

    // ============ Query ============

    fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.retrieval.top_k)
            .min(self.config.retrieval.max_results)
    }

    async fn retrieve(
        &self,
        question: &str,
        query_vec: &[f32],
        options: &QueryOptions,
    ) -> Result<Vec<RetrievalResult>> {
        let req = RetrievalRequest {
            query_vec,
            query_text: question,
            top_k: self.effective_top_k(options.top_k),
            strategy: options.strategy.unwrap_or(self.config.retrieval.strategy),
            similarity_threshold: options
                .similarity_threshold
                .unwrap_or(self.config.retrieval.similarity_threshold),
            filters: &options.filters,
        };
        self.engine.retrieve(&req).await.map_err(RagError::Index)
    }

    /// Summarize `retrieved` into a context block. Empty results give an
    /// empty context.
    async fn context_for(&self, question: &str, retrieved: &[RetrievalResult]) -> (String, bool) {
        if retrieved.is_empty() {
            return (String::new(), false);
        }
        let digest = self
            .summarizer
            .summarize(retrieved, question, self.config.summarization.max_length)
            .await;
        (
            build_context(&digest.text, self.config.generation.max_context_chars),
            digest.degraded,
        )
    }

    fn answer_prompt(&self, question: &str, response_type: ResponseType, context: &str) -> String {
        if context.is_empty() {
            no_context_prompt(question)
        } else {
            fit_prompt(
                |ctx| medical_prompt(response_type, question, ctx),
                context,
                self.config.generation.max_prompt_chars,
            )
        }
    }

    /// Every stage up to (not including) generation.
    async fn prepare(
        &self,
        question: &str,
        options: &QueryOptions,
        tracker: &mut StageTracker,
    ) -> Result<PreparedAnswer> {
        let query_vec = self.embedder.embed(question).await;
        advance(tracker, QueryStage::QueryEmbedded);

        let retrieved = self.retrieve(question, &query_vec, options).await?;
        advance(tracker, QueryStage::Retrieved);
        debug!(results = retrieved.len(), "retrieval finished");

        let (context, digest_degraded) = self.context_for(question, &retrieved).await;
        if !retrieved.is_empty() {
            advance(tracker, QueryStage::Summarized);
        }
        advance(tracker, QueryStage::ContextBuilt);

        let prompt = self.answer_prompt(question, options.response_type, &context);
        Ok(PreparedAnswer {
            retrieved,
            context,
            prompt,
            digest_degraded,
        })
    }

    /// Answer one question.
    pub async fn query(&self, question: &str, options: &QueryOptions) -> PipelineResult {
        let mut tracker = StageTracker::new(Uuid::new_v4().to_string());
        info!(chars = question.chars().count(), "query received");

        let prepared = match self.prepare(question, options, &mut tracker).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, stage = %tracker.current(), "query failed");
                tracker.fail();
                return self.failed_result(question, options, tracker.current());
            }
        };

        advance(&mut tracker, QueryStage::Generating);
        let generated = self
            .generator
            .generate(&prepared.prompt, &self.generator.defaults())
            .await;
        advance(&mut tracker, QueryStage::Done);

        info!(
            results = prepared.retrieved.len(),
            outcome = ?generated.outcome,
            "query answered"
        );
        self.finish(question, options, prepared, generated, tracker.current())
    }

    fn finish(
        &self,
        question: &str,
        options: &QueryOptions,
        prepared: PreparedAnswer,
        generated: Generated,
        stage: QueryStage,
    ) -> PipelineResult {
        PipelineResult {
            question: question.to_string(),
            degraded: prepared.retrieved.is_empty()
                || prepared.digest_degraded
                || generated.is_degraded(),
            answer: generated.text,
            context: prepared.context,
            retrieved_documents: to_documents(&prepared.retrieved),
            response_type: options.response_type,
            timestamp: Utc::now(),
            generation: generated.outcome,
            stage,
        }
    }

    fn failed_result(&self, question: &str, options: &QueryOptions, stage: QueryStage) -> PipelineResult {
        PipelineResult {
            question: question.to_string(),
            answer: PIPELINE_ERROR_MESSAGE.to_string(),
            context: String::new(),
            retrieved_documents: Vec::new(),
            response_type: options.response_type,
            timestamp: Utc::now(),
            degraded: true,
            generation: GenerationOutcome::Skipped,
            stage,
        }
    }

    /// Answer several questions concurrently. Each result is independent;
    /// a failing question yields its own fallback result.
    pub async fn batch_query(&self, questions: &[String], options: &QueryOptions) -> Vec<PipelineResult> {
        info!(questions = questions.len(), "batch query");
        join_all(questions.iter().map(|q| self.query(q, options))).await
    }

    /// Continue a conversation. The last turn must be from the user; it is
    /// the retrieval query, and the last `history_window` turns go into the
    /// prompt.
    pub async fn chat(&self, messages: &[ChatTurn], top_k: Option<usize>) -> ChatResponse {
        let question = match messages.last() {
            Some(turn) if turn.is_user() && !turn.content.trim().is_empty() => turn.content.as_str(),
            _ => {
                warn!(turns = messages.len(), "chat has no user question");
                return ChatResponse {
                    answer: EMPTY_CHAT_MESSAGE.to_string(),
                    context: String::new(),
                    retrieved_documents: Vec::new(),
                    degraded: true,
                    generation: GenerationOutcome::Skipped,
                    timestamp: Utc::now(),
                };
            }
        };
        info!(turns = messages.len(), "chat request");

        let options = QueryOptions {
            top_k,
            ..Default::default()
        };
        let query_vec = self.embedder.embed(question).await;
        let retrieved = match self.retrieve(question, &query_vec, &options).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "chat retrieval failed, answering without context");
                Vec::new()
            }
        };
        let (context, digest_degraded) = self.context_for(question, &retrieved).await;

        let prompt = chat_prompt(messages, &context, self.config.generation.history_window);
        let params = self.generator.defaults().with_temperature(0.3).with_top_p(0.8);
        let generated = self.generator.generate(&prompt, &params).await;

        ChatResponse {
            degraded: retrieved.is_empty() || digest_degraded || generated.is_degraded(),
            answer: generated.text,
            context,
            retrieved_documents: to_documents(&retrieved),
            generation: generated.outcome,
            timestamp: Utc::now(),
        }
    }

    /// Retrieval without generation.
    pub async fn search(
        &self,
        query: &str,
        search_type: SearchType,
        top_k: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievalResult>> {
        let top_k = top_k.min(self.config.retrieval.max_results);
        let strategy = match search_type {
            SearchType::Keyword => {
                return self
                    .engine
                    .keyword_search(query, top_k, filters)
                    .await
                    .map_err(RagError::Index)
            }
            SearchType::Semantic => RetrievalStrategy::Semantic,
            SearchType::Hybrid => RetrievalStrategy::Hybrid,
        };
        let query_vec = self.embedder.embed(query).await;
        let options = QueryOptions {
            top_k: Some(top_k),
            strategy: Some(strategy),
            filters: filters.clone(),
            ..Default::default()
        };
        self.retrieve(query, &query_vec, &options).await
    }

    // ============ Administration ============

    pub async fn get_stats(&self) -> Result<PipelineStats> {
        let summary = self.index.summary().await.map_err(RagError::Index)?;
        Ok(PipelineStats {
            index_size: summary.entries,
            document_count: summary.documents,
            embedder: self.embedder.stats(),
            strategy: self.config.retrieval.strategy,
            similarity_threshold: self.config.retrieval.similarity_threshold,
            generator: self.generator.backend_name().to_string(),
            categories: summary.categories,
            sources: summary.sources,
            timestamp: Utc::now(),
        })
    }

    /// Remove a document's entries. Returns how many were removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let removed = self
            .index
            .remove_document(document_id)
            .await
            .map_err(RagError::Index)?;
        info!(document_id, removed, "document deleted");
        Ok(removed)
    }

    pub async fn documents_by_category(&self, category: &str) -> Result<Vec<DocumentSummary>> {
        self.documents_matching(&RetrievalFilters {
            category: Some(category.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn documents_by_source(&self, source: &str) -> Result<Vec<DocumentSummary>> {
        self.documents_matching(&RetrievalFilters {
            source: Some(source.to_string()),
            ..Default::default()
        })
        .await
    }

    async fn documents_matching(&self, filters: &RetrievalFilters) -> Result<Vec<DocumentSummary>> {
        let entries = self
            .engine
            .entries_matching(filters)
            .await
            .map_err(RagError::Index)?;
        Ok(group_documents(&entries))
    }

    /// The indexed document `document_id`, if present.
    pub async fn get_document(&self, document_id: &str) -> Result<Option<DocumentSummary>> {
        let entries = self.index.entries().await.map_err(RagError::Index)?;
        let own: Vec<Arc<IndexEntry>> = entries
            .into_iter()
            .filter(|e| e.document_id() == document_id)
            .collect();
        Ok(group_documents(&own).into_iter().next())
    }

    /// Patch the metadata of every entry of `document_id`. Content and
    /// vectors are untouched. Returns how many entries were updated; zero
    /// means the document is not indexed.
    pub async fn update_document(&self, document_id: &str, patch: &MetadataPatch) -> Result<usize> {
        if patch.is_empty() {
            return Ok(0);
        }
        let updated = self
            .index
            .update_metadata(document_id, patch)
            .await
            .map_err(RagError::Index)?;
        if updated == 0 {
            warn!(document_id, "document not found for update");
        } else {
            info!(document_id, updated, "document metadata updated");
        }
        Ok(updated)
    }

    /// Write the index to `dir/index.sqlite` and the active configuration
    /// to `dir/config.toml`.
    pub async fn save(&self, dir: &Path) -> Result<SnapshotMeta> {
        let entries = self.index.entries().await.map_err(RagError::Index)?;
        let meta = SnapshotMeta {
            dims: self.embedder.dims(),
            provider: self.embedder.provider().to_string(),
            model: self.embedder.model_name().to_string(),
            saved_at: Utc::now(),
            entries: entries.len(),
        };
        snapshot::save(dir, &entries, &meta).await?;

        let config_toml = toml::to_string_pretty(self.config.as_ref())
            .map_err(|e| RagError::Configuration(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(dir.join(CONFIG_FILE), config_toml).await?;

        info!(dir = %dir.display(), entries = meta.entries, "index saved");
        Ok(meta)
    }

    /// Replace the index contents with the snapshot in `dir`. Returns
    /// `None` when `dir` holds no snapshot.
    ///
    /// # Errors
    ///
    /// [`RagError::Configuration`] when the snapshot's dimension differs
    /// from the active embedder's.
    pub async fn load(&self, dir: &Path) -> Result<Option<SnapshotMeta>> {
        let Some((meta, entries)) = snapshot::load(dir).await? else {
            debug!(dir = %dir.display(), "no snapshot");
            return Ok(None);
        };

        if !entries.is_empty() && meta.dims != self.embedder.dims() {
            return Err(RagError::Configuration(format!(
                "snapshot in {} has {}-dimensional vectors ({} / {}), active embedder produces {} ({} / {})",
                dir.display(),
                meta.dims,
                meta.provider,
                meta.model,
                self.embedder.dims(),
                self.embedder.provider(),
                self.embedder.model_name()
            )));
        }
        if meta.model != self.embedder.model_name() {
            warn!(
                snapshot_model = %meta.model,
                active_model = self.embedder.model_name(),
                "snapshot was built with a different embedding model"
            );
        }

        let loaded = self.index.replace_all(entries).await.map_err(RagError::Index)?;
        info!(dir = %dir.display(), entries = loaded, "index loaded");
        Ok(Some(meta))
    }

    /// Remove every indexed entry.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear().await.map_err(RagError::Index)?;
        info!("index cleared");
        Ok(())
    }
}
