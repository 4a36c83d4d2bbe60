//! Embedding capability trait, vector utilities, and the lexical fallback
//! vectorizer.
//!
//! Model-backed embedders (fastembed, user-supplied ONNX models) live in
//! the `medical-rag` app crate; everything here is pure computation.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A text embedding capability: "given text, return a fixed-size vector".
///
/// Implementations return one vector per input, in input order, each of
/// length [`dims`](TextEmbedder::dims). Vectors need not be normalized;
/// the app's `Embedder` normalizes everything it hands out.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Returns the model identifier (e.g. `"bge-small-zh-v1.5"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use medrag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Scale `v` to unit L2 norm in place.
///
/// Returns `false` (and zeroes the vector) when the norm is zero or not
/// finite, so callers get the explicit "embedding unavailable" sentinel.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        v.iter_mut().for_each(|x| *x = 0.0);
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

/// True when every component is exactly zero.
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|&x| x == 0.0)
}

/// L2 norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0xF900..=0xFAFF)
}

/// Split text into lexical terms.
///
/// Runs of CJK characters contribute every character and every adjacent
/// character pair (so `高血压` yields `高 血 压 高血 血压`); runs of other
/// alphanumeric characters contribute one lowercased word. Punctuation and
/// whitespace separate terms.
pub fn lexical_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut word = String::new();
    let mut prev_cjk: Option<char> = None;

    for c in text.chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                terms.push(std::mem::take(&mut word));
            }
            terms.push(c.to_string());
            if let Some(p) = prev_cjk {
                let mut bigram = String::with_capacity(8);
                bigram.push(p);
                bigram.push(c);
                terms.push(bigram);
            }
            prev_cjk = Some(c);
        } else if c.is_alphanumeric() {
            prev_cjk = None;
            word.extend(c.to_lowercase());
        } else {
            prev_cjk = None;
            if !word.is_empty() {
                terms.push(std::mem::take(&mut word));
            }
        }
    }
    if !word.is_empty() {
        terms.push(word);
    }
    terms
}

/// Hashed term-frequency vectorizer used when no embedding model loads.
///
/// Each term from [`lexical_terms`] is hashed with SHA-256 into one of
/// `dims` buckets; bucket weights use sublinear tf (`1 + ln tf`) and the
/// result is L2-normalized. Vectors are self-consistent for one `dims`
/// value but not comparable with model embeddings.
#[derive(Debug, Clone)]
pub struct LexicalVectorizer {
    dims: usize,
}

impl LexicalVectorizer {
    pub const MODEL_NAME: &'static str = "lexical-tf";

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Vectorize one text. Text with no terms yields the zero vector.
    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<usize, u32> = HashMap::new();
        for term in lexical_terms(text) {
            *counts.entry(self.bucket(&term)).or_insert(0) += 1;
        }

        let mut v = vec![0.0f32; self.dims];
        for (bucket, tf) in counts {
            v[bucket] = 1.0 + (tf as f32).ln();
        }
        l2_normalize(&mut v);
        v
    }

    fn bucket(&self, term: &str) -> usize {
        let digest = Sha256::digest(term.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dims as u64) as usize
    }
}

#[async_trait]
impl TextEmbedder for LexicalVectorizer {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}
