//! Embedder: provider selection, batching, and normalization.
//!
//! The [`Embedder`] wraps one [`TextEmbedder`] chosen at construction time
//! from an ordered provider chain:
//!
//! | Provider | Source |
//! |----------|--------|
//! | `local-path` | `embedding.local_model_path` directory (ONNX + tokenizer files) |
//! | `cached` | `embedding.model` already in `embedding.cache_dir` |
//! | `remote` | `embedding.model` downloaded into `embedding.cache_dir`, with retries |
//! | `lexical` | [`LexicalVectorizer`], always available |
//!
//! The first provider that loads wins and is never re-decided. Calls into
//! the embedder never fail: empty text, backend errors, and malformed
//! backend output all produce the zero vector with a warning.
//!
//! # Retry Strategy
//!
//! The `remote` provider retries downloads with exponential backoff:
//! `backoff_ms × 2^(attempt-1)`, exponent capped at 5.

#[cfg(feature = "local-embeddings-fastembed")]
pub mod local;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use medrag_core::embedding::{l2_normalize, LexicalVectorizer, TextEmbedder};

use crate::config::EmbeddingConfig;
use crate::error::RagError;

/// One entry of the provider fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalPath,
    Cached,
    Remote,
    Lexical,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-path" => Ok(Self::LocalPath),
            "cached" => Ok(Self::Cached),
            "remote" => Ok(Self::Remote),
            "lexical" => Ok(Self::Lexical),
            other => Err(format!("Unknown embedding provider: '{}'", other)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalPath => "local-path",
            Self::Cached => "cached",
            Self::Remote => "remote",
            Self::Lexical => "lexical",
        })
    }
}

/// An image embedding capability: "given an image file, return a vector".
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>>;
}

/// What the active embedder is, for stats output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedderStats {
    pub provider: ProviderKind,
    pub model: String,
    pub dims: usize,
    pub image_model: Option<String>,
}

#[derive(Clone)]
pub struct Embedder {
    backend: Arc<dyn TextEmbedder>,
    kind: ProviderKind,
    batch_size: usize,
    image: Option<Arc<dyn ImageEmbedder>>,
}

impl Embedder {
    /// Walk the configured provider chain and keep the first that loads.
    ///
    /// # Errors
    ///
    /// [`RagError::Configuration`] when the chain names an unknown provider
    /// or no provider loads.
    pub async fn from_config(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let batch_size = config.batch_size.max(1);
        let mut failures = Vec::new();

        for name in &config.providers {
            let kind: ProviderKind = name.parse().map_err(RagError::Configuration)?;
            match load_provider(kind, config).await {
                Ok(backend) => {
                    info!(
                        provider = %kind,
                        model = backend.model_name(),
                        dims = backend.dims(),
                        "embedding provider loaded"
                    );
                    let mut embedder = Self::with_backend(backend, kind, batch_size);
                    if let Some(image_model) = &config.image_model {
                        embedder.image = load_image_backend(image_model, config).await;
                    }
                    return Ok(embedder);
                }
                Err(e) => {
                    warn!(provider = %kind, error = %e, "embedding provider unavailable");
                    failures.push(format!("{}: {:#}", kind, e));
                }
            }
        }

        Err(RagError::Configuration(format!(
            "no embedding provider could be loaded ({})",
            failures.join("; ")
        )))
    }

    pub fn with_backend(backend: Arc<dyn TextEmbedder>, kind: ProviderKind, batch_size: usize) -> Self {
        Self {
            backend,
            kind,
            batch_size: batch_size.max(1),
            image: None,
        }
    }

    /// An embedder over the lexical vectorizer alone.
    pub fn lexical(dims: usize) -> Self {
        Self::with_backend(Arc::new(LexicalVectorizer::new(dims)), ProviderKind::Lexical, 32)
    }

    pub fn with_image_backend(mut self, image: Arc<dyn ImageEmbedder>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub fn provider(&self) -> ProviderKind {
        self.kind
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn stats(&self) -> EmbedderStats {
        EmbedderStats {
            provider: self.kind,
            model: self.model_name().to_string(),
            dims: self.dims(),
            image_model: self.image.as_ref().map(|i| i.model_name().to_string()),
        }
    }

    /// Embed one text. Returns the zero vector when no embedding is
    /// available.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_batch(&[text.to_string()])
            .await
            .pop()
            .unwrap_or_else(|| vec![0.0; self.dims()])
    }

    /// Embed many texts, `batch_size` at a time. Output has one vector per
    /// input, in order; each is unit length or exactly zero.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let dims = self.dims();
        let mut out = vec![vec![0.0f32; dims]; texts.len()];

        // Empty texts keep the zero vector and are not sent to the backend.
        let live: Vec<usize> = (0..texts.len())
            .filter(|&i| !texts[i].trim().is_empty())
            .collect();

        for batch in live.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            match self.backend.embed_texts(&inputs).await {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    for (&i, mut v) in batch.iter().zip(vectors) {
                        if v.len() != dims {
                            warn!(
                                error = %RagError::EmbeddingUnavailable(format!(
                                    "backend returned {} dims, expected {}",
                                    v.len(),
                                    dims
                                )),
                                "embedding discarded"
                            );
                            continue;
                        }
                        if l2_normalize(&mut v) {
                            out[i] = v;
                        } else {
                            debug!(index = i, "embedding has zero norm");
                        }
                    }
                }
                Ok(vectors) => {
                    warn!(
                        error = %RagError::EmbeddingUnavailable(format!(
                            "backend returned {} vectors for {} inputs",
                            vectors.len(),
                            inputs.len()
                        )),
                        "embedding batch discarded"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %RagError::EmbeddingUnavailable(format!("{:#}", e)),
                        batch = inputs.len(),
                        "embedding batch failed"
                    );
                }
            }
        }
        out
    }

    /// Embed an image file into the text vector space. Returns the zero
    /// vector when no image model is loaded, the model fails, or its
    /// dimension differs from the text embedder's.
    pub async fn embed_image(&self, path: &Path) -> Vec<f32> {
        let dims = self.dims();
        let zero = vec![0.0f32; dims];
        let Some(image) = &self.image else {
            warn!(path = %path.display(), "no image model loaded");
            return zero;
        };
        if image.dims() != dims {
            warn!(
                image_dims = image.dims(),
                text_dims = dims,
                "image model dimension differs from text embedder"
            );
            return zero;
        }
        match image.embed_image(path).await {
            Ok(mut v) if v.len() == dims => {
                if l2_normalize(&mut v) {
                    v
                } else {
                    zero
                }
            }
            Ok(v) => {
                warn!(got = v.len(), expected = dims, "image embedding has wrong dimension");
                zero
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %RagError::EmbeddingUnavailable(format!("{:#}", e)),
                    "image embedding failed"
                );
                zero
            }
        }
    }
}

async fn load_provider(kind: ProviderKind, config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>> {
    match kind {
        ProviderKind::Lexical => Ok(Arc::new(LexicalVectorizer::new(config.lexical_dims))),
        _ => load_model_provider(kind, config).await,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn load_model_provider(
    kind: ProviderKind,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn TextEmbedder>> {
    let backend: Arc<dyn TextEmbedder> = match kind {
        ProviderKind::LocalPath => {
            let dir = config
                .local_model_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("embedding.local_model_path is not set"))?;
            Arc::new(local::load_user_defined(dir, config.batch_size).await?)
        }
        ProviderKind::Cached => {
            Arc::new(local::load_cached(&config.model, &config.cache_dir, config.batch_size).await?)
        }
        ProviderKind::Remote => {
            let mut last_err = None;
            let mut loaded = None;
            for attempt in 0..=config.max_retries {
                if attempt > 0 {
                    let delay = std::time::Duration::from_millis(config.backoff_ms << (attempt - 1).min(5));
                    tokio::time::sleep(delay).await;
                }
                match local::load_remote(&config.model, &config.cache_dir, config.batch_size).await {
                    Ok(backend) => {
                        loaded = Some(backend);
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "model download failed");
                        last_err = Some(e);
                    }
                }
            }
            match loaded {
                Some(backend) => Arc::new(backend),
                None => {
                    return Err(last_err
                        .unwrap_or_else(|| anyhow::anyhow!("model download failed after retries")))
                }
            }
        }
        ProviderKind::Lexical => Arc::new(LexicalVectorizer::new(config.lexical_dims)),
    };
    Ok(backend)
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
async fn load_model_provider(
    kind: ProviderKind,
    _config: &EmbeddingConfig,
) -> Result<Arc<dyn TextEmbedder>> {
    anyhow::bail!(
        "embedding provider '{}' requires --features local-embeddings-fastembed",
        kind
    )
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn load_image_backend(name: &str, config: &EmbeddingConfig) -> Option<Arc<dyn ImageEmbedder>> {
    match local::load_image_model(name, &config.cache_dir).await {
        Ok(backend) => Some(Arc::new(backend)),
        Err(e) => {
            warn!(model = name, error = %e, "image model unavailable");
            None
        }
    }
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
async fn load_image_backend(name: &str, _config: &EmbeddingConfig) -> Option<Arc<dyn ImageEmbedder>> {
    warn!(model = name, "image models require --features local-embeddings-fastembed");
    None
}
