//! Hybrid retrieval and re-ranking.
//!
//! Dense (cosine over stored embeddings) and lexical (FTS5 BM25) retrieval
//! fused with Reciprocal Rank Fusion, then cross-encoder re-ranking,
//! query-biased compression, and context expansion over linked chunks.

mod compress;
mod expand;
mod rerank;
mod rrf;
mod sizing;

pub use compress::{COMPRESS_TARGET_TOKENS, COMPRESS_THRESHOLD_TOKENS, compress_for_query};
pub use expand::ContextExpander;
pub use rerank::{
    CrossEncoder, DEFAULT_RERANK_BATCH_SIZE, LexicalOverlapEncoder, Reranker, sigmoid,
};
pub use rrf::{RrfConfig, reciprocal_rank_fusion};
pub use sizing::{QueryType, QueryUnderstanding, RetrievalSizing, max_expansion, max_total};

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::DocChunk;
use crate::embedding::{Embedder, cosine_similarity};
use crate::error::Result;
use crate::storage::{ChunkFilter, SharedStore, with_store};

/// A chunk surfaced by retrieval, carrying its scores through the
/// re-ranking and expansion stages.
///
/// Serializable so workflow stages can pass selected chunks through the
/// durable task payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrievedChunk {
    /// Storage rowid (global key across documents).
    pub rowid: i64,
    /// The chunk record.
    pub chunk: DocChunk,
    /// Fused RRF score from hybrid retrieval.
    pub hybrid_score: f64,
    /// Dense cosine similarity, when the dense leg surfaced this chunk.
    pub semantic_score: Option<f32>,
    /// BM25 score, when the lexical leg surfaced this chunk.
    pub bm25_score: Option<f64>,
    /// Cross-encoder score in [0,1], set by re-ranking.
    pub rerank_score: Option<f32>,
    /// Query-biased compressed text, set for oversized narratives.
    pub compressed_text: Option<String>,
    /// Whether this chunk arrived via context expansion.
    pub expanded: bool,
}

impl RetrievedChunk {
    /// The best available relevance score: rerank when present, else the
    /// fused hybrid score.
    #[must_use]
    pub fn best_score(&self) -> f64 {
        self.rerank_score.map_or(self.hybrid_score, f64::from)
    }

    /// Text used for scoring and context assembly: the compressed form
    /// when present, otherwise the full chunk text.
    #[must_use]
    pub fn scoring_text(&self) -> &str {
        self.compressed_text.as_deref().unwrap_or(&self.chunk.text)
    }
}

/// Hybrid retriever: dense + lexical legs fused by RRF.
pub struct HybridRetriever {
    store: SharedStore,
    embedder: Arc<dyn Embedder>,
    rrf: RrfConfig,
}

impl Clone for HybridRetriever {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            embedder: Arc::clone(&self.embedder),
            rrf: self.rrf,
        }
    }
}

impl std::fmt::Debug for HybridRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRetriever").field("rrf", &self.rrf).finish()
    }
}

impl HybridRetriever {
    /// Creates a retriever over the given store and embedder.
    #[must_use]
    pub fn new(store: SharedStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            rrf: RrfConfig::default(),
        }
    }

    /// Retrieves up to `top_k` chunks for a query under a scope filter.
    ///
    /// The lexical leg matches the (reformulated) query text; the dense leg
    /// embeds the HyDE hypothetical answer when the query-understanding
    /// step produced one, otherwise the query itself. A minimum similarity
    /// floor filters weak dense matches.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding or search fails.
    pub fn retrieve(
        &self,
        query: &str,
        filter: &ChunkFilter,
        top_k: usize,
        understanding: Option<&QueryUnderstanding>,
        min_semantic_similarity: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        // Dense leg: HyDE text when available, else the raw query
        let dense_text = understanding
            .and_then(|u| u.hypothetical_answer.as_deref())
            .unwrap_or(query);
        let query_embedding = self.embedder.embed(dense_text)?;

        let embeddings = with_store(&self.store, |s| s.embeddings_for_filter(filter))?;
        let mut semantic: Vec<(i64, f32)> = embeddings
            .iter()
            .map(|(rowid, embedding)| (*rowid, cosine_similarity(&query_embedding, embedding)))
            .filter(|(_, sim)| *sim >= min_semantic_similarity)
            .collect();
        semantic.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        semantic.truncate(top_k * 2);

        // Lexical leg
        let bm25 = with_store(&self.store, |s| s.search_fts(query, filter, top_k * 2))?;

        tracing::debug!(
            dense = semantic.len(),
            lexical = bm25.len(),
            "hybrid legs retrieved"
        );

        // Fuse by RRF over rowids
        let semantic_ranked: Vec<i64> = semantic.iter().map(|(id, _)| *id).collect();
        let bm25_ranked: Vec<i64> = bm25.iter().map(|(id, _)| *id).collect();
        let fused = reciprocal_rank_fusion(&[&semantic_ranked, &bm25_ranked], &self.rrf);

        let semantic_map: HashMap<i64, f32> = semantic.into_iter().collect();
        let bm25_map: HashMap<i64, f64> = bm25.into_iter().collect();

        let mut results = Vec::with_capacity(top_k);
        for (rowid, rrf_score) in fused.into_iter().take(top_k) {
            let row = with_store(&self.store, |s| s.get_chunk_row(rowid))?;
            let Some(row) = row else { continue };
            results.push(RetrievedChunk {
                rowid,
                chunk: row.chunk,
                hybrid_score: rrf_score,
                semantic_score: semantic_map.get(&rowid).copied(),
                bm25_score: bm25_map.get(&rowid).copied(),
                rerank_score: None,
                compressed_text: None,
                expanded: false,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkKind, DocChunkBuilder, Document};
    use crate::embedding::{DEFAULT_DIMENSIONS, FallbackEmbedder};
    use crate::storage::{SqliteStore, shared};

    fn setup_corpus() -> (SharedStore, Arc<dyn Embedder>, Document) {
        let mut store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();

        let doc = Document::new("u1", "org1", "deal.pdf", b"retrieval corpus");
        store.insert_document(&doc).unwrap();

        let texts = [
            "The quick brown fox jumps over the lazy dog",
            "Net operating income increased across the portfolio",
            "Rust is a systems programming language",
        ];
        let chunks: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                DocChunkBuilder::new(&doc.id, &format!("sec_{i}"), 1, ChunkKind::Narrative)
                    .text((*text).to_string())
                    .build()
            })
            .collect();
        let rowids = store.add_chunks(&chunks).unwrap();

        let embedder: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS));
        let embeddings: Vec<(i64, Vec<f32>)> = chunks
            .iter()
            .zip(&rowids)
            .map(|(chunk, rowid)| (*rowid, embedder.embed(&chunk.text).unwrap()))
            .collect();
        store.store_embeddings_batch(&embeddings, None).unwrap();

        (shared(store), embedder, doc)
    }

    #[test]
    fn test_hybrid_retrieval_finds_lexical_match() {
        let (store, embedder, _doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        let results = retriever
            .retrieve("fox", &ChunkFilter::default(), 5, None, 0.0)
            .unwrap();
        assert!(!results.is_empty());
        assert!(results[0].chunk.text.contains("fox"));
        assert!(results[0].bm25_score.is_some());
    }

    #[test]
    fn test_hybrid_retrieval_document_filter() {
        let (store, embedder, _doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        let results = retriever
            .retrieve("fox", &ChunkFilter::document("missing-doc"), 5, None, 0.0)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_hyde_drives_dense_leg() {
        let (store, embedder, _doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        let understanding = QueryUnderstanding {
            hypothetical_answer: Some(
                "Net operating income increased across the portfolio".to_string(),
            ),
            ..QueryUnderstanding::passthrough("how did noi develop")
        };
        let results = retriever
            .retrieve(
                "how did noi develop",
                &ChunkFilter::default(),
                3,
                Some(&understanding),
                0.0,
            )
            .unwrap();
        assert!(!results.is_empty());
        let top_semantic = results
            .iter()
            .filter_map(|r| r.semantic_score.map(|s| (r.chunk.text.clone(), s)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        assert!(top_semantic.unwrap().0.contains("operating income"));
    }

    #[test]
    fn test_similarity_floor_filters_dense() {
        let (store, embedder, _doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        // Impossible floor: dense leg contributes nothing, lexical still works
        let results = retriever
            .retrieve("fox", &ChunkFilter::default(), 5, None, 0.99)
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.semantic_score.is_none()));
    }

    #[test]
    fn test_top_k_zero() {
        let (store, embedder, _doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        let results = retriever
            .retrieve("fox", &ChunkFilter::default(), 0, None, 0.0)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_retrieve_by_query_and_by_document_agree() {
        // Same chunks appear whether scoped by query over all docs or
        // filtered to the owning document.
        let (store, embedder, doc) = setup_corpus();
        let retriever = HybridRetriever::new(store, embedder);
        let all = retriever
            .retrieve("fox", &ChunkFilter::default(), 10, None, 0.0)
            .unwrap();
        let scoped = retriever
            .retrieve("fox", &ChunkFilter::document(&doc.id), 10, None, 0.0)
            .unwrap();
        let all_ids: std::collections::HashSet<_> =
            all.iter().map(|r| r.chunk.chunk_id.clone()).collect();
        let scoped_ids: std::collections::HashSet<_> =
            scoped.iter().map(|r| r.chunk.chunk_id.clone()).collect();
        assert_eq!(all_ids, scoped_ids);
    }
}
