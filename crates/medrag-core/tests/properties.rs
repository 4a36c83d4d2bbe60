//! Property tests for chunking and retrieval invariants.

use std::sync::Arc;

use medrag_core::chunk::{ChunkStrategy, Chunker, ChunkerConfig};
use medrag_core::index::memory::InMemoryIndex;
use medrag_core::index::VectorIndex;
use medrag_core::models::{Chunk, EntryMetadata, IndexEntry, RetrievalFilters};
use medrag_core::retrieval::{
    BlendWeights, GroupBy, RetrievalEngine, RetrievalRequest, RetrievalStrategy,
};
use proptest::prelude::*;

fn arb_text() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            Just("高血压患者需要低盐饮食。".to_string()),
            Just("Take the medicine twice a day. ".to_string()),
            Just("\n\n".to_string()),
            Just("主诉：头痛三天\n".to_string()),
            "[a-z ]{1,40}",
            "[一-龥]{1,30}",
        ],
        0..30,
    )
    .prop_map(|parts| parts.concat())
}

fn arb_strategy() -> impl Strategy<Value = ChunkStrategy> {
    prop_oneof![
        Just(ChunkStrategy::FixedSize),
        Just(ChunkStrategy::Sentence),
        Just(ChunkStrategy::Paragraph),
        Just(ChunkStrategy::Semantic),
        Just(ChunkStrategy::Structured),
    ]
}

/// Sizes accepted by [`ChunkerConfig::validate`].
fn arb_sizes() -> impl Strategy<Value = (usize, usize, usize, usize)> {
    (20usize..200, 0usize..50, 1usize..=100, 0usize..50).prop_map(
        |(chunk_size, overlap_pct, min_pct, slack)| {
            let overlap = chunk_size * overlap_pct / 100;
            let min = (chunk_size * min_pct / 100).max(1);
            (chunk_size, overlap, min, chunk_size + min + slack)
        },
    )
}

fn sized_config(strategy: ChunkStrategy, sizes: (usize, usize, usize, usize)) -> ChunkerConfig {
    let (chunk_size, chunk_overlap, min_chunk_size, max_chunk_size) = sizes;
    ChunkerConfig {
        strategy,
        chunk_size,
        chunk_overlap,
        min_chunk_size,
        max_chunk_size,
        ..ChunkerConfig::default()
    }
}

fn arb_normalized(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim).prop_filter_map("non-zero", |mut v| {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < 1e-6 {
            return None;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Some(v)
    })
}

fn entry(i: usize, vector: Vec<f32>) -> IndexEntry {
    IndexEntry::new(
        Chunk {
            id: format!("c{:03}", i),
            document_id: format!("d{}", i % 4),
            chunk_index: 0,
            total_chunks: 1,
            section: None,
            content: format!("entry {}", i),
            length: 7,
            hash: String::new(),
        },
        vector,
        EntryMetadata::default(),
    )
}

mod prop_chunking {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn indices_contiguous_and_deterministic(
            text in arb_text(),
            strategy in arb_strategy(),
            chunk_size in 20usize..200,
        ) {
            let chunker = Chunker::new(ChunkerConfig {
                strategy,
                chunk_size,
                chunk_overlap: chunk_size / 5,
                ..ChunkerConfig::default()
            });
            let first = chunker.chunk("doc", &text);
            let second = chunker.chunk("doc", &text);
            prop_assert_eq!(&first, &second);

            if text.trim().is_empty() {
                prop_assert!(first.is_empty());
            }
            for (i, c) in first.iter().enumerate() {
                prop_assert_eq!(c.chunk_index, i);
                prop_assert_eq!(c.total_chunks, first.len());
                prop_assert_eq!(c.length, c.content.chars().count());
                prop_assert!(!c.content.trim().is_empty());
            }
        }

        #[test]
        fn only_last_chunk_may_be_undersized(
            text in arb_text(),
            strategy in arb_strategy(),
            sizes in arb_sizes(),
        ) {
            let config = sized_config(strategy, sizes);
            prop_assert!(config.validate().is_ok());
            let min = config.min_chunk_size;
            let chunks = Chunker::new(config).chunk("doc", &text);
            if let Some((_, interior)) = chunks.split_last() {
                for c in interior {
                    prop_assert!(
                        c.length >= min,
                        "interior chunk {} of {} chars < {}: {:?}",
                        c.chunk_index, c.length, min, c.content
                    );
                }
            }
        }

        #[test]
        fn fixed_size_windows_overlap_and_cover(
            text in "[一-龥。！？a-z.,]{0,400}",
            sizes in arb_sizes(),
        ) {
            let config = sized_config(ChunkStrategy::FixedSize, sizes);
            let overlap = config.chunk_overlap;
            let chunks = Chunker::new(config).chunk("doc", &text);
            if text.is_empty() {
                prop_assert!(chunks.is_empty());
                return Ok(());
            }

            for pair in chunks.windows(2) {
                let tail: String = pair[0].content.chars().skip(pair[0].length - overlap).collect();
                let head: String = pair[1].content.chars().take(overlap).collect();
                prop_assert_eq!(tail, head);
            }

            let mut rebuilt = chunks[0].content.clone();
            for c in &chunks[1..] {
                rebuilt.extend(c.content.chars().skip(overlap));
            }
            prop_assert_eq!(rebuilt, text);
        }

        #[test]
        fn fixed_size_windows_bounded(
            text in arb_text(),
            chunk_size in 20usize..120,
        ) {
            let chunker = Chunker::new(ChunkerConfig {
                strategy: ChunkStrategy::FixedSize,
                chunk_size,
                chunk_overlap: chunk_size / 4,
                ..ChunkerConfig::default()
            });
            for c in chunker.chunk("doc", &text) {
                prop_assert!(c.length <= chunk_size);
            }
        }
    }
}

mod prop_retrieval {
    use super::*;

    const DIM: usize = 8;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn raising_threshold_yields_prefix(
            vectors in proptest::collection::vec(arb_normalized(DIM), 1..25),
            query in arb_normalized(DIM),
            top_k in 1usize..10,
            low in -1.0f32..1.0,
            delta in 0.0f32..1.0,
            by_document in any::<bool>(),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (loose, strict) = rt.block_on(async {
                let index = InMemoryIndex::new();
                let entries = vectors.into_iter().enumerate().map(|(i, v)| entry(i, v)).collect();
                index.insert(entries).await.unwrap();
                let group_by = if by_document { GroupBy::Document } else { GroupBy::Chunk };
                let engine = RetrievalEngine::new(Arc::new(index), BlendWeights::default(), group_by);
                let filters = RetrievalFilters::default();
                let mut req = RetrievalRequest {
                    query_vec: &query,
                    query_text: "entry",
                    top_k,
                    strategy: RetrievalStrategy::Semantic,
                    similarity_threshold: low,
                    filters: &filters,
                };
                let loose = engine.retrieve(&req).await.unwrap();
                req.similarity_threshold = low + delta;
                let strict = engine.retrieve(&req).await.unwrap();
                (loose, strict)
            });

            prop_assert!(loose.len() <= top_k);
            prop_assert!(strict.len() <= loose.len());
            for (s, l) in strict.iter().zip(loose.iter()) {
                prop_assert_eq!(s.entry.id(), l.entry.id());
            }
            for w in loose.windows(2) {
                prop_assert!(w[0].score >= w[1].score);
            }
            for (i, r) in loose.iter().enumerate() {
                prop_assert_eq!(r.rank, i + 1);
            }
        }
    }
}
