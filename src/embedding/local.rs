//! fastembed-backed model providers.
//!
//! Inference is synchronous and needs `&mut` access to the ONNX session, so
//! each model sits behind a `Mutex` and every call runs on the blocking
//! thread pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use medrag_core::embedding::TextEmbedder;

use super::ImageEmbedder;

/// Files a user-supplied model directory must contain.
pub const MODEL_FILES: &[&str] = &[
    "model.onnx",
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

pub struct FastEmbedBackend {
    name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedBackend {
    /// Wrap a loaded model and probe it once to learn its dimension.
    async fn probe(name: String, model: TextEmbedding, batch_size: usize) -> Result<Self> {
        let model = Arc::new(Mutex::new(model));
        let probe = run_text(model.clone(), vec!["医学".to_string()], batch_size).await?;
        let dims = probe
            .first()
            .map(|v| v.len())
            .filter(|&d| d > 0)
            .ok_or_else(|| anyhow!("model {} returned an empty probe embedding", name))?;
        Ok(Self {
            name,
            dims,
            batch_size,
            model,
        })
    }
}

#[async_trait]
impl TextEmbedder for FastEmbedBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        run_text(self.model.clone(), texts.to_vec(), self.batch_size).await
    }
}

async fn run_text(
    model: Arc<Mutex<TextEmbedding>>,
    texts: Vec<String>,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    tokio::task::spawn_blocking(move || {
        let mut model = model
            .lock()
            .map_err(|_| anyhow!("embedding model lock poisoned"))?;
        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

/// Map a configured model name to a fastembed model.
pub fn config_to_fastembed_model(name: &str) -> Result<EmbeddingModel> {
    match name {
        "bge-small-zh-v1.5" => Ok(EmbeddingModel::BGESmallZHV15),
        "bge-large-zh-v1.5" => Ok(EmbeddingModel::BGELargeZHV15),
        "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(EmbeddingModel::MultilingualE5Large),
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        other => bail!(
            "Unknown embedding model: '{}'. Supported models: \
             bge-small-zh-v1.5, bge-large-zh-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large, \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
            other
        ),
    }
}

/// Hugging Face cache directory for `model` under `cache_dir`
/// (`models--<org>--<name>`).
pub fn cache_entry(cache_dir: &Path, model: &EmbeddingModel) -> Result<PathBuf> {
    let info = TextEmbedding::get_model_info(model).map_err(|e| anyhow!("{}", e))?;
    Ok(cache_dir.join(format!("models--{}", info.model_code.replace('/', "--"))))
}

/// Load a model from a directory of ONNX and tokenizer files.
pub async fn load_user_defined(dir: &Path, batch_size: usize) -> Result<FastEmbedBackend> {
    let read = |file: &str| -> Result<Vec<u8>> {
        let path = dir.join(file);
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    };
    let onnx = read(MODEL_FILES[0])?;
    let tokenizer_files = TokenizerFiles {
        tokenizer_file: read(MODEL_FILES[1])?,
        config_file: read(MODEL_FILES[2])?,
        special_tokens_map_file: read(MODEL_FILES[3])?,
        tokenizer_config_file: read(MODEL_FILES[4])?,
    };

    let model = tokio::task::spawn_blocking(move || {
        TextEmbedding::try_new_from_user_defined(
            UserDefinedEmbeddingModel::new(onnx, tokenizer_files),
            InitOptionsUserDefined::default(),
        )
        .map_err(|e| anyhow!("Failed to initialize user-defined model: {}", e))
    })
    .await??;

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string());
    FastEmbedBackend::probe(name, model, batch_size).await
}

/// Load a named model only if it is already in the cache directory.
pub async fn load_cached(name: &str, cache_dir: &Path, batch_size: usize) -> Result<FastEmbedBackend> {
    let model = config_to_fastembed_model(name)?;
    let entry = cache_entry(cache_dir, &model)?;
    if !entry.is_dir() {
        bail!("model {} is not cached at {}", name, entry.display());
    }
    load_named(name, model, cache_dir, false, batch_size).await
}

/// Load a named model, downloading it into the cache directory if needed.
pub async fn load_remote(name: &str, cache_dir: &Path, batch_size: usize) -> Result<FastEmbedBackend> {
    let model = config_to_fastembed_model(name)?;
    load_named(name, model, cache_dir, true, batch_size).await
}

async fn load_named(
    name: &str,
    model: EmbeddingModel,
    cache_dir: &Path,
    show_progress: bool,
    batch_size: usize,
) -> Result<FastEmbedBackend> {
    let cache_dir = cache_dir.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || {
        TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(show_progress),
        )
        .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))
    })
    .await??;
    FastEmbedBackend::probe(name.to_string(), loaded, batch_size).await
}

/// CLIP image embedder.
pub struct ClipImageBackend {
    name: String,
    dims: usize,
    model: Arc<Mutex<ImageEmbedding>>,
}

fn config_to_image_model(name: &str) -> Result<(ImageEmbeddingModel, usize)> {
    match name {
        "clip-vit-b-32" => Ok((ImageEmbeddingModel::ClipVitB32, 512)),
        other => bail!("Unknown image model: '{}'. Supported models: clip-vit-b-32", other),
    }
}

pub async fn load_image_model(name: &str, cache_dir: &Path) -> Result<ClipImageBackend> {
    let (model, dims) = config_to_image_model(name)?;
    let cache_dir = cache_dir.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || {
        ImageEmbedding::try_new(ImageInitOptions::new(model).with_cache_dir(cache_dir))
            .map_err(|e| anyhow!("Failed to initialize image model: {}", e))
    })
    .await??;
    Ok(ClipImageBackend {
        name: name.to_string(),
        dims,
        model: Arc::new(Mutex::new(loaded)),
    })
}

#[async_trait]
impl ImageEmbedder for ClipImageBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let images = vec![path.to_path_buf()];
        let mut out = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("image model lock poisoned"))?;
            model
                .embed(images, None)
                .map_err(|e| anyhow!("Image embedding failed: {}", e))
        })
        .await??;
        out.pop().ok_or_else(|| anyhow!("image model returned no embedding"))
    }
}
