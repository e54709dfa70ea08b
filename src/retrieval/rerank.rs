//! Cross-encoder re-ranking.
//!
//! Fused retrieval candidates are re-scored by a cross-encoder over
//! (query, chunk-text) pairs. Scoring runs in bounded batches on a blocking
//! thread so model inference never stalls the cooperative scheduler.
//!
//! The [`CrossEncoder`] trait is the seam to real model inference; the
//! default [`LexicalOverlapEncoder`] is a deterministic IDF-flavoured
//! token-overlap scorer that keeps re-ranking and comparison pairing fully
//! testable without model weights.

use std::collections::HashSet;
use std::sync::Arc;

use unicode_segmentation::UnicodeSegmentation;

use super::compress::compress_for_query;
use super::sizing::{QueryType, QueryUnderstanding};
use crate::core::ChunkKind;
use crate::error::{Result, RetrievalError};

/// Relevance bonus applied to table chunks for numeric queries.
const TABLE_BOOST: f32 = 1.1;

/// Default batch size for pair scoring.
pub const DEFAULT_RERANK_BATCH_SIZE: usize = 32;

/// Trait for cross-encoder scoring backends.
///
/// Implementations return raw (unbounded) relevance logits; callers
/// normalize with a sigmoid where a [0,1] score is needed.
pub trait CrossEncoder: Send + Sync {
    /// Scores (query, passage) pairs. Returns one logit per pair.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>>;
}

/// Deterministic lexical-overlap scorer used when no model-backed encoder
/// is configured.
///
/// Scores by weighted token overlap: rarer (longer) tokens count more, and
/// the result is mapped to a logit so sigmoid normalization lands identical
/// pairs near 1.0 and disjoint pairs near 0.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalOverlapEncoder;

impl LexicalOverlapEncoder {
    fn overlap_fraction(a: &str, b: &str) -> f32 {
        let tokens_a: HashSet<String> = a.unicode_words().map(str::to_lowercase).collect();
        let tokens_b: HashSet<String> = b.unicode_words().map(str::to_lowercase).collect();
        if tokens_a.is_empty() || tokens_b.is_empty() {
            return 0.0;
        }

        let weight = |t: &str| -> f32 {
            // Longer tokens carry more signal than stopword-length ones.
            #[allow(clippy::cast_precision_loss)]
            let len = t.chars().count() as f32;
            (len / 4.0).min(2.0)
        };

        let shared: f32 = tokens_a.intersection(&tokens_b).map(|t| weight(t)).sum();
        let total: f32 = tokens_a.iter().map(|t| weight(t)).sum();
        if total == 0.0 { 0.0 } else { shared / total }
    }
}

impl CrossEncoder for LexicalOverlapEncoder {
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
        Ok(pairs
            .iter()
            .map(|(a, b)| {
                let fraction = Self::overlap_fraction(a, b);
                // Map [0,1] overlap to a logit in [-4, 4]
                8.0f32.mul_add(fraction, -4.0)
            })
            .collect())
    }
}

/// Logistic sigmoid, used to normalize cross-encoder logits to [0,1].
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Re-ranker over fused retrieval candidates.
pub struct Reranker {
    encoder: Arc<dyn CrossEncoder>,
    batch_size: usize,
}

impl Clone for Reranker {
    fn clone(&self) -> Self {
        Self {
            encoder: Arc::clone(&self.encoder),
            batch_size: self.batch_size,
        }
    }
}

impl std::fmt::Debug for Reranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reranker")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new(Arc::new(LexicalOverlapEncoder), DEFAULT_RERANK_BATCH_SIZE)
    }
}

impl Reranker {
    /// Creates a re-ranker over the given encoder.
    #[must_use]
    pub fn new(encoder: Arc<dyn CrossEncoder>, batch_size: usize) -> Self {
        Self {
            encoder,
            batch_size: batch_size.max(1),
        }
    }

    /// Re-ranks candidates against a query.
    ///
    /// Oversized narrative chunks are compressed before scoring (tables and
    /// key-value chunks keep their full content). Scores are normalized to
    /// [0,1] and numeric-flavoured queries boost table chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails.
    pub async fn rerank(
        &self,
        query: &str,
        mut chunks: Vec<super::RetrievedChunk>,
        understanding: Option<&QueryUnderstanding>,
        top_k: usize,
    ) -> Result<Vec<super::RetrievedChunk>> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        // Compress narratives only; tables and key-value chunks are never
        // compressed so figures survive scoring intact.
        for candidate in &mut chunks {
            if candidate.chunk.kind == ChunkKind::Narrative {
                candidate.compressed_text = compress_for_query(query, &candidate.chunk.text);
            }
        }

        let pairs: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (query.to_string(), c.scoring_text().to_string()))
            .collect();

        let logits = self.score_batched(pairs).await?;

        let boost_tables = Self::prefers_tables(query, understanding);
        for (candidate, logit) in chunks.iter_mut().zip(logits) {
            let mut score = sigmoid(logit);
            if boost_tables && candidate.chunk.is_table() {
                score = (score * TABLE_BOOST).min(1.0);
            }
            candidate.rerank_score = Some(score);
        }

        chunks.sort_by(|a, b| {
            b.best_score()
                .partial_cmp(&a.best_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(top_k);
        Ok(chunks)
    }

    /// Scores all cross-document pairs for comparison pairing, returning a
    /// matrix of sigmoid-normalized scores where `matrix[i][j]` scores
    /// `(texts_a[i], texts_b[j])`.
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails.
    pub async fn score_matrix(
        &self,
        texts_a: &[String],
        texts_b: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if texts_a.is_empty() || texts_b.is_empty() {
            return Ok(vec![vec![0.0; texts_b.len()]; texts_a.len()]);
        }

        let mut pairs = Vec::with_capacity(texts_a.len() * texts_b.len());
        for a in texts_a {
            for b in texts_b {
                pairs.push((a.clone(), b.clone()));
            }
        }

        let logits = self.score_batched(pairs).await?;

        let mut matrix = vec![vec![0.0f32; texts_b.len()]; texts_a.len()];
        for (index, logit) in logits.into_iter().enumerate() {
            let i = index / texts_b.len();
            let j = index % texts_b.len();
            matrix[i][j] = sigmoid(logit);
        }
        Ok(matrix)
    }

    /// Runs pair scoring in bounded batches on a blocking thread.
    async fn score_batched(&self, pairs: Vec<(String, String)>) -> Result<Vec<f32>> {
        let encoder = Arc::clone(&self.encoder);
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut scores = Vec::with_capacity(pairs.len());
            for batch in pairs.chunks(batch_size) {
                scores.extend(encoder.score_pairs(batch)?);
            }
            Ok(scores)
        })
        .await
        .map_err(|e| RetrievalError::Rerank(format!("scoring task failed: {e}")))?
    }

    /// Whether the query should prefer table chunks: explicitly numeric
    /// queries (digits present) or data-extraction intent.
    fn prefers_tables(query: &str, understanding: Option<&QueryUnderstanding>) -> bool {
        if query.chars().any(|c| c.is_ascii_digit()) {
            return true;
        }
        understanding.is_some_and(|u| u.query_type == QueryType::DataExtraction)
    }
}
