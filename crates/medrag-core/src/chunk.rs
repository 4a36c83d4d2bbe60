//! Multi-strategy document chunker.
//!
//! Splits document text into [`Chunk`]s bounded by `chunk_size` characters.
//! All lengths are counted in Unicode scalar values, so Chinese clinical
//! text and ASCII text are measured the same way.
//!
//! # Strategies
//!
//! | Strategy | Behaviour |
//! |----------|-----------|
//! | `fixed_size` | Sliding window with `chunk_overlap`, optionally cut back to the last sentence terminator |
//! | `sentence` | Greedy packing of whole sentences |
//! | `paragraph` | Packing of blank-line separated paragraphs; oversized paragraphs fall back to fixed-size |
//! | `semantic` | Alias of `paragraph` |
//! | `structured` | Medical record sections (主诉, 现病史, …) split by header lines |
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and index, plus a SHA-256 hash of its text, so re-chunking an unchanged
//! document yields identical chunks.
//!
//! # Example
//!
//! ```rust
//! use medrag_core::chunk::{Chunker, ChunkerConfig, ChunkStrategy};
//!
//! let chunker = Chunker::new(ChunkerConfig {
//!     strategy: ChunkStrategy::FixedSize,
//!     chunk_size: 50,
//!     chunk_overlap: 10,
//!     ..ChunkerConfig::default()
//! });
//! let chunks = chunker.chunk("doc-1", &"a".repeat(120));
//! assert_eq!(chunks.len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::Chunk;

/// Lines at least this long are treated as body text, never as headers.
pub const HEADER_MAX_CHARS: usize = 50;

/// Section headers recognised by the structured strategy by default.
pub const DEFAULT_SECTION_KEYWORDS: &[&str] = &[
    "主诉",
    "现病史",
    "既往史",
    "个人史",
    "家族史",
    "体格检查",
    "辅助检查",
    "诊断",
    "治疗",
    "预后",
    "症状",
    "体征",
    "检查结果",
    "诊断意见",
    "治疗建议",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    FixedSize,
    #[default]
    Sentence,
    Paragraph,
    /// Alias of [`ChunkStrategy::Paragraph`].
    Semantic,
    Structured,
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" | "fixed_size" | "fixed-size" => Ok(Self::FixedSize),
            "sentence" | "sentence_based" => Ok(Self::Sentence),
            "paragraph" | "paragraph_based" => Ok(Self::Paragraph),
            "semantic" => Ok(Self::Semantic),
            "structured" | "structured_section" => Ok(Self::Structured),
            other => Err(format!(
                "Unknown chunking strategy: '{}'. Use fixed_size, sentence, paragraph, semantic, or structured.",
                other
            )),
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FixedSize => "fixed_size",
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
            Self::Semantic => "semantic",
            Self::Structured => "structured",
        };
        f.write_str(name)
    }
}

/// Chunking parameters. Sizes are in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub preserve_sentence_boundaries: bool,
    pub preserve_paragraph_boundaries: bool,
    pub section_header_keywords: Vec<String>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            chunk_size: 512,
            chunk_overlap: 50,
            min_chunk_size: 20,
            max_chunk_size: 1024,
            preserve_sentence_boundaries: true,
            preserve_paragraph_boundaries: true,
            section_header_keywords: DEFAULT_SECTION_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

impl ChunkerConfig {
    /// Check that the sizes admit the chunk length floor.
    ///
    /// Every raw piece is at most `chunk_size` long and joining adds at most
    /// one separator character, so an undersized interior piece can always
    /// be folded into its successor when
    /// `max_chunk_size >= chunk_size + min_chunk_size`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be > 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            anyhow::bail!("chunk_overlap must be < chunk_size");
        }
        if self.min_chunk_size > self.chunk_size {
            anyhow::bail!("min_chunk_size must be <= chunk_size");
        }
        if self.chunk_size > self.max_chunk_size {
            anyhow::bail!("chunk_size must be <= max_chunk_size");
        }
        if self.chunk_size + self.min_chunk_size > self.max_chunk_size {
            anyhow::bail!(
                "max_chunk_size ({}) must be >= chunk_size + min_chunk_size ({})",
                self.max_chunk_size,
                self.chunk_size + self.min_chunk_size
            );
        }
        Ok(())
    }
}

/// Intermediate chunk text before IDs and indices are assigned.
#[derive(Debug, Clone)]
struct Piece {
    text: String,
    section: Option<String>,
}

impl Piece {
    fn plain(text: String) -> Self {
        Self {
            text,
            section: None,
        }
    }

    fn len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A configured chunker. Cheap to clone; holds no state between calls.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into ordered chunks belonging to `document_id`.
    ///
    /// # Guarantees
    ///
    /// - Empty or whitespace-only text yields no chunks.
    /// - Text shorter than `min_chunk_size` yields exactly one chunk.
    /// - Chunk indices are contiguous `0..N` and `total_chunks == N`.
    /// - The same input and configuration always yield the same chunks.
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let pieces = if trimmed.chars().count() < self.config.min_chunk_size {
            vec![Piece::plain(trimmed.to_string())]
        } else {
            match self.config.strategy {
                ChunkStrategy::FixedSize => {
                    let chars: Vec<char> = text.chars().collect();
                    self.fixed_size(&chars).into_iter().map(Piece::plain).collect()
                }
                ChunkStrategy::Sentence => {
                    let chars: Vec<char> = trimmed.chars().collect();
                    let pieces = self.pack_sentences(&chars).into_iter().map(Piece::plain).collect();
                    self.merge_undersized(pieces)
                }
                ChunkStrategy::Paragraph | ChunkStrategy::Semantic => {
                    let pieces = self.pack_paragraphs(trimmed);
                    self.merge_undersized(pieces)
                }
                ChunkStrategy::Structured => {
                    let pieces = self.split_sections(trimmed);
                    self.merge_undersized(pieces)
                }
            }
        };

        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, p)| make_chunk(document_id, i, total, p.section, &p.text))
            .collect()
    }

    /// Sliding window of `chunk_size` characters stepping by
    /// `chunk_size - chunk_overlap` (or less, when a window is cut back to
    /// a sentence terminator).
    fn fixed_size(&self, chars: &[char]) -> Vec<String> {
        let len = chars.len();
        let size = self.config.chunk_size.max(1);
        let overlap = self.config.chunk_overlap.min(size - 1);
        // A sentence cut must leave the window longer than this so that
        // `start` always advances and no interior chunk is undersized.
        let floor_len = overlap.max(self.config.min_chunk_size);

        let mut pieces = Vec::new();
        let mut start = 0;

        while start < len {
            let mut end = (start + size).min(len);
            if end < len && self.config.preserve_sentence_boundaries {
                if let Some(cut) = find_sentence_cut(chars, start + floor_len, end) {
                    end = cut;
                }
            }

            let piece: String = chars[start..end].iter().collect();
            if !piece.trim().is_empty() {
                pieces.push(piece);
            }

            if end >= len {
                break;
            }
            start = end - overlap;
        }

        pieces
    }

    fn pack_sentences(&self, chars: &[char]) -> Vec<String> {
        let size = self.config.chunk_size.max(1);
        let mut pieces = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (s, e) in sentence_spans(chars) {
            if e - s > size {
                if let Some((cs, ce)) = current.take() {
                    pieces.push(chars[cs..ce].iter().collect());
                }
                pieces.extend(self.fixed_size(&chars[s..e]));
                continue;
            }
            current = match current {
                Some((cs, ce)) if e - cs > size => {
                    pieces.push(chars[cs..ce].iter().collect());
                    Some((s, e))
                }
                Some((cs, _)) => Some((cs, e)),
                None => Some((s, e)),
            };
        }

        if let Some((cs, ce)) = current {
            pieces.push(chars[cs..ce].iter().collect());
        }
        pieces
    }

    fn pack_paragraphs(&self, text: &str) -> Vec<Piece> {
        if !self.config.preserve_paragraph_boundaries {
            let chars: Vec<char> = text.chars().collect();
            return self.pack_sentences(&chars).into_iter().map(Piece::plain).collect();
        }

        let size = self.config.chunk_size.max(1);
        let mut pieces = Vec::new();
        let mut buf = String::new();
        let mut buf_len = 0;

        for para in paragraphs(text) {
            let para_len = para.chars().count();

            if para_len > size {
                if !buf.is_empty() {
                    pieces.push(Piece::plain(std::mem::take(&mut buf)));
                    buf_len = 0;
                }
                let chars: Vec<char> = para.chars().collect();
                pieces.extend(self.fixed_size(&chars).into_iter().map(Piece::plain));
                continue;
            }

            if !buf.is_empty() && buf_len + 2 + para_len > size {
                pieces.push(Piece::plain(std::mem::take(&mut buf)));
                buf_len = 0;
            }
            if !buf.is_empty() {
                buf.push_str("\n\n");
                buf_len += 2;
            }
            buf.push_str(&para);
            buf_len += para_len;
        }

        if !buf.is_empty() {
            pieces.push(Piece::plain(buf));
        }
        pieces
    }

    fn split_sections(&self, text: &str) -> Vec<Piece> {
        let size = self.config.chunk_size.max(1);
        let mut sections: Vec<(Option<String>, Vec<String>)> = vec![(None, Vec::new())];

        for line in text.lines() {
            if let Some((label, rest)) = self.match_header(line) {
                let mut body = Vec::new();
                if !rest.is_empty() {
                    body.push(rest);
                }
                sections.push((Some(label), body));
            } else if !line.trim().is_empty() {
                if let Some((_, body)) = sections.last_mut() {
                    body.push(line.trim().to_string());
                }
            }
        }

        let mut pieces = Vec::new();
        for (label, lines) in sections {
            if lines.is_empty() {
                continue;
            }
            let body = lines.join("\n");
            let chars: Vec<char> = body.chars().collect();
            if chars.len() <= size {
                pieces.push(Piece {
                    text: body,
                    section: label,
                });
            } else {
                for text in self.pack_sentences(&chars) {
                    pieces.push(Piece {
                        text,
                        section: label.clone(),
                    });
                }
            }
        }
        pieces
    }

    /// Returns `(label, remainder)` when `line` is a section header.
    ///
    /// A header starts with a configured keyword (after list or heading
    /// markup), is shorter than [`HEADER_MAX_CHARS`], and the keyword is
    /// followed by end of line or a separator.
    fn match_header(&self, line: &str) -> Option<(String, String)> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().count() >= HEADER_MAX_CHARS {
            return None;
        }

        let stripped = trimmed.trim_start_matches(|c: char| {
            c.is_ascii_digit()
                || c.is_whitespace()
                || matches!(c, '#' | '*' | '-' | '【' | '[' | '(' | '（' | ')' | '）' | '.' | '、')
        });

        let keyword = self
            .config
            .section_header_keywords
            .iter()
            .filter(|k| !k.is_empty() && stripped.starts_with(k.as_str()))
            .max_by_key(|k| k.chars().count())?;

        let after = &stripped[keyword.len()..];
        let is_separated = after.is_empty()
            || after.starts_with(|c: char| {
                c.is_whitespace() || matches!(c, '：' | ':' | '】' | ']' | '）' | ')')
            });
        if !is_separated {
            return None;
        }

        let rest = after
            .trim_start_matches(|c: char| {
                c.is_whitespace() || matches!(c, '：' | ':' | '】' | ']' | '）' | ')')
            })
            .trim()
            .to_string();
        Some((keyword.clone(), rest))
    }

    /// Fold pieces shorter than `min_chunk_size` into a neighbour while the
    /// result stays within `max_chunk_size`. With a config that passes
    /// [`ChunkerConfig::validate`] only the final piece can stay undersized.
    fn merge_undersized(&self, pieces: Vec<Piece>) -> Vec<Piece> {
        let min = self.config.min_chunk_size;
        let max = self.config.max_chunk_size.max(self.config.chunk_size);
        let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());

        for piece in pieces {
            if let Some(last) = out.last_mut() {
                let last_len = last.len();
                let piece_len = piece.len();
                let sep = joiner(&last.text, &piece.text);
                let fits = last_len + sep.chars().count() + piece_len <= max;
                if fits && (last_len < min || piece_len < min) {
                    last.text.push_str(sep);
                    last.text.push_str(&piece.text);
                    last.section = merge_labels(last.section.take(), piece.section);
                    continue;
                }
            }
            out.push(piece);
        }
        out
    }
}

/// Whether `chars[i]` ends a sentence.
///
/// CJK terminators always end a sentence; an ASCII `.` only when followed
/// by whitespace or end of text, so decimals like `36.5` survive.
pub fn is_sentence_end(chars: &[char], i: usize) -> bool {
    match chars[i] {
        '。' | '！' | '？' | '；' | '!' | '?' | ';' => true,
        '.' => chars.get(i + 1).map_or(true, |c| c.is_whitespace()),
        _ => false,
    }
}

/// Search backward in `[floor, end)` for a terminator; returns the index
/// just past it.
fn find_sentence_cut(chars: &[char], floor: usize, end: usize) -> Option<usize> {
    if floor >= end {
        return None;
    }
    (floor..end).rev().find(|&i| is_sentence_end(chars, i)).map(|i| i + 1)
}

/// Sentence spans as `(start, end)` character ranges, trimmed of
/// surrounding whitespace.
fn sentence_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut raw = Vec::new();
    let mut start = 0;
    for i in 0..chars.len() {
        if is_sentence_end(chars, i) {
            raw.push((start, i + 1));
            start = i + 1;
        }
    }
    if start < chars.len() {
        raw.push((start, chars.len()));
    }

    raw.into_iter()
        .filter_map(|(mut s, mut e)| {
            while s < e && chars[s].is_whitespace() {
                s += 1;
            }
            while e > s && chars[e - 1].is_whitespace() {
                e -= 1;
            }
            (s < e).then_some((s, e))
        })
        .collect()
}

/// Blank-line separated paragraphs with trailing whitespace trimmed.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

fn joiner(prev: &str, next: &str) -> &'static str {
    let prev_ascii = prev.chars().last().is_some_and(|c| c.is_ascii());
    let next_ascii = next.chars().next().is_some_and(|c| c.is_ascii());
    if prev_ascii && next_ascii {
        " "
    } else {
        ""
    }
}

fn merge_labels(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) if a != b => Some(format!("{} / {}", a, b)),
        (Some(a), _) => Some(a),
        (None, b) => b,
    }
}

/// The one chunk of an unchunked input (e.g. an image document's caption).
pub fn whole_document_chunk(document_id: &str, text: &str) -> Chunk {
    make_chunk(document_id, 0, 1, None, text)
}

/// Create a [`Chunk`] with a deterministic UUID and SHA-256 content hash.
fn make_chunk(
    document_id: &str,
    index: usize,
    total: usize,
    section: Option<String>,
    text: &str,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let name = format!("{}#{}", document_id, index);
    Chunk {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        total_chunks: total,
        section,
        content: text.to_string(),
        length: text.chars().count(),
        hash,
    }
}
