//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. [`load_config`] parses and validates; [`Config::validate`]
//! can be called on programmatically built configs.
//!
//! ```toml
//! [embedding]
//! providers = ["local-path", "cached", "remote", "lexical"]
//! model = "bge-small-zh-v1.5"
//!
//! [retrieval]
//! strategy = "hybrid"
//! similarity_threshold = 0.3
//!
//! [generation]
//! provider = "openai"
//! base_url = "http://127.0.0.1:1234"
//! timeout_secs = 600
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use medrag_core::chunk::{ChunkStrategy, ChunkerConfig, DEFAULT_SECTION_KEYWORDS};
use medrag_core::retrieval::{BlendWeights, GroupBy, RetrievalStrategy};

use crate::error::{RagError, Result};

/// Embedding provider names accepted in `embedding.providers`.
pub const EMBEDDING_PROVIDERS: &[&str] = &["local-path", "cached", "remote", "lexical"];

/// Generation backend names accepted in `generation.provider`.
pub const GENERATION_PROVIDERS: &[&str] = &["openai", "disabled"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider fallback chain, tried in order once at startup.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// fastembed model name for the `cached` and `remote` providers.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Directory holding `model.onnx` and tokenizer files for `local-path`.
    #[serde(default)]
    pub local_model_path: Option<PathBuf>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_lexical_dims")]
    pub lexical_dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// CLIP image model name; `None` disables image embedding.
    #[serde(default)]
    pub image_model: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            model: default_embedding_model(),
            local_model_path: None,
            cache_dir: default_cache_dir(),
            lexical_dims: default_lexical_dims(),
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            backoff_ms: default_backoff_ms(),
            image_model: None,
        }
    }
}

fn default_providers() -> Vec<String> {
    EMBEDDING_PROVIDERS.iter().map(|p| p.to_string()).collect()
}
fn default_embedding_model() -> String {
    "bge-small-zh-v1.5".to_string()
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".fastembed_cache")
}
fn default_lexical_dims() -> usize {
    1024
}
fn default_batch_size() -> usize {
    32
}
fn default_embedding_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_true")]
    pub preserve_sentence_boundaries: bool,
    #[serde(default = "default_true")]
    pub preserve_paragraph_boundaries: bool,
    #[serde(default = "default_section_keywords")]
    pub section_header_keywords: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            preserve_sentence_boundaries: true,
            preserve_paragraph_boundaries: true,
            section_header_keywords: default_section_keywords(),
        }
    }
}

impl ChunkingConfig {
    pub fn to_chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            strategy: self.strategy,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
            preserve_sentence_boundaries: self.preserve_sentence_boundaries,
            preserve_paragraph_boundaries: self.preserve_paragraph_boundaries,
            section_header_keywords: self.section_header_keywords.clone(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_min_chunk_size() -> usize {
    20
}
fn default_max_chunk_size() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_section_keywords() -> Vec<String> {
    DEFAULT_SECTION_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub strategy: RetrievalStrategy,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Upper bound on any caller-supplied `top_k`.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    #[serde(default = "default_title_weight")]
    pub title_weight: f32,
    #[serde(default = "default_content_weight")]
    pub content_weight: f32,
    #[serde(default = "default_tag_weight")]
    pub tag_weight: f32,
    #[serde(default)]
    pub group_by: GroupBy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::default(),
            similarity_threshold: default_threshold(),
            top_k: default_top_k(),
            max_results: default_max_results(),
            semantic_weight: default_semantic_weight(),
            lexical_weight: default_lexical_weight(),
            title_weight: default_title_weight(),
            content_weight: default_content_weight(),
            tag_weight: default_tag_weight(),
            group_by: GroupBy::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn weights(&self) -> BlendWeights {
        BlendWeights {
            semantic: self.semantic_weight,
            lexical: self.lexical_weight,
            title: self.title_weight,
            content: self.content_weight,
            tags: self.tag_weight,
        }
    }
}

fn default_threshold() -> f32 {
    0.3
}
fn default_top_k() -> usize {
    5
}
fn default_max_results() -> usize {
    20
}
fn default_semantic_weight() -> f32 {
    0.7
}
fn default_lexical_weight() -> f32 {
    0.3
}
fn default_title_weight() -> f32 {
    0.5
}
fn default_content_weight() -> f32 {
    0.3
}
fn default_tag_weight() -> f32 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    /// Server root of an OpenAI-compatible API (without `/v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Environment variable holding a bearer token, if the server needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_sampling_top_k")]
    pub top_k: u32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// Overall deadline per generation. Zero means already expired.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_backoff_ms")]
    pub backoff_ms: u64,
    /// Prior conversation turns included in chat prompts.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            base_url: default_base_url(),
            model: default_generation_model(),
            api_key_env: None,
            max_prompt_chars: default_max_prompt_chars(),
            max_context_chars: default_max_context_chars(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_sampling_top_k(),
            repetition_penalty: default_repetition_penalty(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_generation_retries(),
            backoff_ms: default_generation_backoff_ms(),
            history_window: default_history_window(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:1234".to_string()
}
fn default_generation_model() -> String {
    "local-model".to_string()
}
fn default_max_prompt_chars() -> usize {
    4000
}
fn default_max_context_chars() -> usize {
    800
}
fn default_max_new_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_sampling_top_k() -> u32 {
    50
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_generation_retries() -> u32 {
    2
}
fn default_generation_backoff_ms() -> u64 {
    500
}
fn default_history_window() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationConfig {
    #[serde(default = "default_summary_length")]
    pub max_length: usize,
    #[serde(default = "default_summary_input")]
    pub max_input_chars: usize,
    #[serde(default = "default_fallback_passages")]
    pub fallback_passages: usize,
    #[serde(default = "default_fallback_chars")]
    pub fallback_chars: usize,
    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,
    #[serde(default = "default_summary_tokens")]
    pub max_new_tokens: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            max_length: default_summary_length(),
            max_input_chars: default_summary_input(),
            fallback_passages: default_fallback_passages(),
            fallback_chars: default_fallback_chars(),
            temperature: default_summary_temperature(),
            max_new_tokens: default_summary_tokens(),
        }
    }
}

fn default_summary_length() -> usize {
    200
}
fn default_summary_input() -> usize {
    1000
}
fn default_fallback_passages() -> usize {
    3
}
fn default_fallback_chars() -> usize {
    100
}
fn default_summary_temperature() -> f32 {
    0.3
}
fn default_summary_tokens() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshot directory used by the CLI (`index.sqlite` + `config.toml`).
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/index")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

fn bad(msg: impl Into<String>) -> RagError {
    RagError::Configuration(msg.into())
}

impl Config {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.chunking
            .to_chunker_config()
            .validate()
            .map_err(|e| bad(format!("chunking: {}", e)))?;

        let r = &self.retrieval;
        if !(-1.0..=1.0).contains(&r.similarity_threshold) {
            return Err(bad("retrieval.similarity_threshold must be in [-1.0, 1.0]"));
        }
        if r.max_results == 0 {
            return Err(bad("retrieval.max_results must be >= 1"));
        }
        for (name, w) in [
            ("semantic_weight", r.semantic_weight),
            ("lexical_weight", r.lexical_weight),
            ("title_weight", r.title_weight),
            ("content_weight", r.content_weight),
            ("tag_weight", r.tag_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(bad(format!("retrieval.{} must be in [0.0, 1.0]", name)));
            }
        }

        let e = &self.embedding;
        if e.providers.is_empty() {
            return Err(bad("embedding.providers must name at least one provider"));
        }
        for p in &e.providers {
            if !EMBEDDING_PROVIDERS.contains(&p.as_str()) {
                return Err(bad(format!(
                    "Unknown embedding provider: '{}'. Must be one of: {}",
                    p,
                    EMBEDDING_PROVIDERS.join(", ")
                )));
            }
        }
        if e.batch_size == 0 {
            return Err(bad("embedding.batch_size must be > 0"));
        }
        if e.lexical_dims == 0 {
            return Err(bad("embedding.lexical_dims must be > 0"));
        }

        let g = &self.generation;
        if !GENERATION_PROVIDERS.contains(&g.provider.as_str()) {
            return Err(bad(format!(
                "Unknown generation provider: '{}'. Must be openai or disabled.",
                g.provider
            )));
        }
        if g.max_context_chars == 0 {
            return Err(bad("generation.max_context_chars must be > 0"));
        }

        if self.summarization.max_length == 0 {
            return Err(bad("summarization.max_length must be > 0"));
        }

        Ok(())
    }
}

/// Parse a TOML configuration string and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| bad(format!("Failed to parse config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        bad(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.similarity_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.generation.timeout_secs, 600);
        assert_eq!(config.embedding.providers, default_providers());
        assert_eq!(config.retrieval.weights(), BlendWeights::default());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse_config(
            r#"
[chunking]
strategy = "structured"
chunk_size = 300

[retrieval]
strategy = "rerank"
group_by = "document"
"#,
        )
        .unwrap();
        assert_eq!(config.chunking.strategy, ChunkStrategy::Structured);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval.strategy, RetrievalStrategy::Rerank);
        assert_eq!(config.retrieval.group_by, GroupBy::Document);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[chunking]\nchunk_size = 0",
            "[chunking]\nchunk_size = 50\nchunk_overlap = 50",
            "[chunking]\nmin_chunk_size = 2000",
            "[chunking]\nchunk_size = 2048",
            "[chunking]\nchunk_size = 50\nmin_chunk_size = 20\nmax_chunk_size = 50",
            "[chunking]\nchunk_size = 10\nchunk_overlap = 2\nmin_chunk_size = 20",
            "[retrieval]\nsimilarity_threshold = 1.5",
            "[retrieval]\nsemantic_weight = -0.1",
            "[retrieval]\nmax_results = 0",
            "[embedding]\nproviders = [\"onnx\"]",
            "[embedding]\nbatch_size = 0",
            "[generation]\nprovider = \"llama\"",
        ];
        for case in cases {
            let err = parse_config(case).unwrap_err();
            assert!(
                matches!(err, RagError::Configuration(_)),
                "expected configuration error for {:?}",
                case
            );
        }
    }

    #[test]
    fn test_unknown_strategy_is_parse_error() {
        assert!(parse_config("[retrieval]\nstrategy = \"bm25\"").is_err());
    }

    #[test]
    fn test_roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = parse_config(&text).unwrap();
        assert_eq!(back.retrieval.top_k, config.retrieval.top_k);
        assert_eq!(back.chunking.section_header_keywords.len(), 15);
    }
}
