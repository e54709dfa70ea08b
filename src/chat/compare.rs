//! Multi-document comparison retrieval: per-document pipelines executed
//! concurrently, then cross-encoder pairing (2 documents) or clustering
//! (3+), with topic inference and unpaired surfacing.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::retrieval::{
    ContextExpander, HybridRetriever, QueryUnderstanding, Reranker, RetrievedChunk,
};
use crate::storage::{ChunkFilter, SharedStore, with_store};

/// Candidate pool per document before re-ranking.
const CANDIDATES_PER_DOC: usize = 20;

/// A pair of semantically similar chunks from two documents.
#[derive(Debug, Clone)]
pub struct ChunkPair {
    /// Chunk from document A.
    pub chunk_a: RetrievedChunk,
    /// Chunk from document B.
    pub chunk_b: RetrievedChunk,
    /// Sigmoid-normalized cross-encoder similarity in [0,1].
    pub similarity: f32,
    /// Inferred topic label.
    pub topic: String,
}

/// A cluster of similar chunks from three or more documents.
#[derive(Debug, Clone)]
pub struct ChunkCluster {
    /// (document id, chunk) members, anchor first.
    pub chunks: Vec<(String, RetrievedChunk)>,
    /// Inferred topic label.
    pub topic: String,
    /// Average pairwise similarity to the anchor.
    pub avg_similarity: f32,
}

/// Display metadata for a compared document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentLabel {
    /// Document id.
    pub id: String,
    /// Filename.
    pub filename: String,
    /// Display label ("Document A", "Document B", ...).
    pub label: String,
}

/// Comparison retrieval output for client rendering alongside the answer.
#[derive(Debug, Clone)]
pub struct ComparisonContext {
    /// Compared documents in citation order.
    pub documents: Vec<DocumentLabel>,
    /// Pairs (2-document comparison).
    pub pairs: Vec<ChunkPair>,
    /// Clusters (3+ document comparison).
    pub clusters: Vec<ChunkCluster>,
    /// Chunks not consumed by any pair or cluster, per document.
    pub unpaired: BTreeMap<String, Vec<RetrievedChunk>>,
    /// Number of documents compared.
    pub num_documents: usize,
}

impl ComparisonContext {
    /// Client payload for the `comparison_context` event.
    #[must_use]
    pub fn to_event_payload(&self) -> serde_json::Value {
        let pair_json = |pair: &ChunkPair| {
            serde_json::json!({
                "topic": pair.topic,
                "similarity": pair.similarity,
                "chunk_a": chunk_summary(&pair.chunk_a),
                "chunk_b": chunk_summary(&pair.chunk_b),
            })
        };
        let cluster_json = |cluster: &ChunkCluster| {
            serde_json::json!({
                "topic": cluster.topic,
                "avg_similarity": cluster.avg_similarity,
                "chunks": cluster
                    .chunks
                    .iter()
                    .map(|(doc_id, chunk)| {
                        serde_json::json!({"document_id": doc_id, "chunk": chunk_summary(chunk)})
                    })
                    .collect::<Vec<_>>(),
            })
        };
        serde_json::json!({
            "documents": self.documents,
            "pairs": self.pairs.iter().map(pair_json).collect::<Vec<_>>(),
            "clusters": self.clusters.iter().map(cluster_json).collect::<Vec<_>>(),
            "unpaired": self
                .unpaired
                .iter()
                .map(|(doc_id, chunks)| {
                    (
                        doc_id.clone(),
                        chunks.iter().map(chunk_summary).collect::<Vec<_>>(),
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            "num_documents": self.num_documents,
        })
    }
}

fn chunk_summary(retrieved: &RetrievedChunk) -> serde_json::Value {
    let chunk = &retrieved.chunk;
    serde_json::json!({
        "ref": chunk.short_ref(),
        "chunk_id": chunk.chunk_id,
        "page": chunk.citation_page(),
        "section": chunk.section_heading,
        "snippet": chunk.first_sentence(),
    })
}

/// Comparison retriever.
pub struct ComparisonRetriever {
    store: SharedStore,
    retriever: HybridRetriever,
    reranker: Reranker,
    /// Chunks kept per document after re-ranking.
    pub chunks_per_doc: usize,
    /// Similarity threshold for pairing/clustering.
    pub similarity_threshold: f32,
    /// Rerank floor and per-chunk cap for context expansion.
    pub expansion_rerank_floor: f32,
    /// Maximum linked chunks fetched per expanded chunk.
    pub max_expansion_per_chunk: usize,
}

impl ComparisonRetriever {
    /// Creates a comparison retriever.
    #[must_use]
    pub fn new(
        store: SharedStore,
        retriever: HybridRetriever,
        reranker: Reranker,
        chunks_per_doc: usize,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            store,
            retriever,
            reranker,
            chunks_per_doc,
            similarity_threshold,
            expansion_rerank_floor: crate::config::DEFAULT_EXPANSION_RERANK_FLOOR,
            max_expansion_per_chunk: 2,
        }
    }

    /// Retrieves chunks per document (full pipeline, concurrently across
    /// documents), then pairs or clusters them.
    ///
    /// # Errors
    ///
    /// Returns an error when retrieval fails for any document.
    pub async fn retrieve_for_comparison(
        &self,
        query: &str,
        document_ids: &[String],
        understanding: Option<&QueryUnderstanding>,
    ) -> Result<ComparisonContext> {
        let num_docs = document_ids.len();
        tracing::info!(num_docs, "comparison retrieval starting");

        // Parallel fan-out: one full pipeline per document, structured join
        let understanding: Option<Arc<QueryUnderstanding>> =
            understanding.map(|u| Arc::new(u.clone()));
        let mut handles = Vec::with_capacity(num_docs);
        for doc_id in document_ids {
            let store = Arc::clone(&self.store);
            let retriever = self.retriever.clone();
            let reranker = self.reranker.clone();
            let query = query.to_string();
            let doc_id = doc_id.clone();
            let understanding = understanding.clone();
            let chunks_per_doc = self.chunks_per_doc;
            let floor = self.expansion_rerank_floor;
            let max_expansion = self.max_expansion_per_chunk;

            handles.push(tokio::spawn(async move {
                let candidates = retriever.retrieve(
                    &query,
                    &ChunkFilter::document(&doc_id),
                    CANDIDATES_PER_DOC,
                    understanding.as_deref(),
                    0.0,
                )?;
                let ranked = reranker
                    .rerank(&query, candidates, understanding.as_deref(), chunks_per_doc)
                    .await?;
                // Expansion failures degrade to the unexpanded set
                let expanded = ContextExpander
                    .expand(&store, ranked.clone(), floor, max_expansion, chunks_per_doc * 2)
                    .unwrap_or(ranked);
                Ok::<(String, Vec<RetrievedChunk>), crate::Error>((doc_id, expanded))
            }));
        }

        let mut doc_chunks: Vec<(String, Vec<RetrievedChunk>)> = Vec::with_capacity(num_docs);
        for handle in handles {
            let joined = handle.await.map_err(|e| crate::Error::InvalidState {
                message: format!("comparison retrieval task failed: {e}"),
            })?;
            doc_chunks.push(joined?);
        }
        // Preserve the caller's document order
        doc_chunks.sort_by_key(|(doc_id, _)| {
            document_ids.iter().position(|id| id == doc_id).unwrap_or(usize::MAX)
        });

        let documents = self.document_labels(document_ids)?;

        let mut pairs = Vec::new();
        let mut clusters = Vec::new();
        if num_docs == 2 {
            pairs = self
                .pair_chunks(&doc_chunks[0].1, &doc_chunks[1].1)
                .await?;
            tracing::info!(pairs = pairs.len(), "comparison pairing complete");
        } else if num_docs >= 3 {
            clusters = self.cluster_chunks(&doc_chunks).await?;
            tracing::info!(clusters = clusters.len(), "comparison clustering complete");
        }

        let unpaired = collect_unpaired(&doc_chunks, &pairs, &clusters);

        Ok(ComparisonContext {
            documents,
            pairs,
            clusters,
            unpaired,
            num_documents: num_docs,
        })
    }

    /// Greedy pairing for two documents: every A-chunk takes its best
    /// unmatched B-chunk above the threshold; pairs sort by similarity.
    async fn pair_chunks(
        &self,
        chunks_a: &[RetrievedChunk],
        chunks_b: &[RetrievedChunk],
    ) -> Result<Vec<ChunkPair>> {
        if chunks_a.is_empty() || chunks_b.is_empty() {
            return Ok(Vec::new());
        }

        let matrix = self.similarity_matrix(chunks_a, chunks_b).await;

        let mut pairs = Vec::new();
        let mut used_b: HashSet<usize> = HashSet::new();

        for (i, chunk_a) in chunks_a.iter().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (j, _) in chunks_b.iter().enumerate() {
                if used_b.contains(&j) {
                    continue;
                }
                let similarity = matrix[i][j];
                if similarity >= self.similarity_threshold
                    && best.is_none_or(|(_, s)| similarity > s)
                {
                    best = Some((j, similarity));
                }
            }
            if let Some((j, similarity)) = best {
                used_b.insert(j);
                pairs.push(ChunkPair {
                    chunk_a: chunk_a.clone(),
                    chunk_b: chunks_b[j].clone(),
                    similarity,
                    topic: infer_topic(&chunk_a.chunk, Some(&chunks_b[j].chunk)),
                });
            }
        }

        pairs.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(pairs)
    }

    /// Clustering for 3+ documents: the first document's chunks anchor;
    /// each anchor takes its best unmatched chunk from every other
    /// document above the threshold. A cluster forms when at least two
    /// other documents matched.
    async fn cluster_chunks(
        &self,
        doc_chunks: &[(String, Vec<RetrievedChunk>)],
    ) -> Result<Vec<ChunkCluster>> {
        let Some(((anchor_doc, anchor_chunks), others)) = doc_chunks.split_first() else {
            return Ok(Vec::new());
        };

        // Precompute anchor x other similarity matrices
        let mut matrices = Vec::with_capacity(others.len());
        for (_, other_chunks) in others {
            matrices.push(self.similarity_matrix(anchor_chunks, other_chunks).await);
        }

        let mut used: Vec<HashSet<usize>> = others.iter().map(|_| HashSet::new()).collect();
        let mut clusters = Vec::new();

        for (anchor_idx, anchor_chunk) in anchor_chunks.iter().enumerate() {
            let mut members: Vec<(String, RetrievedChunk)> =
                vec![(anchor_doc.clone(), anchor_chunk.clone())];
            let mut similarities = Vec::new();
            let mut claimed: Vec<(usize, usize)> = Vec::new();

            for (other_pos, (other_doc, other_chunks)) in others.iter().enumerate() {
                let mut best: Option<(usize, f32)> = None;
                for (other_idx, _) in other_chunks.iter().enumerate() {
                    if used[other_pos].contains(&other_idx) {
                        continue;
                    }
                    let similarity = matrices[other_pos][anchor_idx][other_idx];
                    if similarity >= self.similarity_threshold
                        && best.is_none_or(|(_, s)| similarity > s)
                    {
                        best = Some((other_idx, similarity));
                    }
                }
                if let Some((other_idx, similarity)) = best {
                    members.push((other_doc.clone(), other_chunks[other_idx].clone()));
                    similarities.push(similarity);
                    claimed.push((other_pos, other_idx));
                }
            }

            // Matches from at least 2 other documents form a cluster
            if similarities.len() >= 2 {
                for (other_pos, other_idx) in claimed {
                    used[other_pos].insert(other_idx);
                }
                #[allow(clippy::cast_precision_loss)]
                let avg_similarity =
                    similarities.iter().sum::<f32>() / similarities.len() as f32;
                clusters.push(ChunkCluster {
                    topic: infer_topic(&anchor_chunk.chunk, None),
                    chunks: members,
                    avg_similarity,
                });
            }
        }

        Ok(clusters)
    }

    /// Cross-encoder similarity matrix with word-level Jaccard fallback.
    async fn similarity_matrix(
        &self,
        chunks_a: &[RetrievedChunk],
        chunks_b: &[RetrievedChunk],
    ) -> Vec<Vec<f32>> {
        let texts_a: Vec<String> = chunks_a.iter().map(|c| c.chunk.text.clone()).collect();
        let texts_b: Vec<String> = chunks_b.iter().map(|c| c.chunk.text.clone()).collect();

        match self.reranker.score_matrix(&texts_a, &texts_b).await {
            Ok(matrix) => matrix,
            Err(e) => {
                tracing::warn!(error = %e, "cross-encoder pairing failed, falling back to Jaccard");
                jaccard_matrix(&texts_a, &texts_b)
            }
        }
    }

    fn document_labels(&self, document_ids: &[String]) -> Result<Vec<DocumentLabel>> {
        let labels = ["Document A", "Document B", "Document C", "Document D", "Document E"];
        let mut out = Vec::with_capacity(document_ids.len());
        for (index, doc_id) in document_ids.iter().enumerate() {
            let filename = with_store(&self.store, |s| s.get_document(doc_id))?
                .map_or_else(
                    || format!("Unknown ({})", &doc_id[..doc_id.len().min(8)]),
                    |d| d.filename,
                );
            out.push(DocumentLabel {
                id: doc_id.clone(),
                filename,
                label: labels
                    .get(index)
                    .map_or_else(|| format!("Document {}", index + 1), |l| (*l).to_string()),
            });
        }
        Ok(out)
    }
}

/// Word-level Jaccard similarity matrix (fallback when the cross-encoder
/// is unavailable).
fn jaccard_matrix(texts_a: &[String], texts_b: &[String]) -> Vec<Vec<f32>> {
    use rayon::prelude::*;

    let words = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };
    let sets_b: Vec<HashSet<String>> = texts_b.iter().map(|t| words(t)).collect();

    texts_a
        .par_iter()
        .map(|text_a| {
            let set_a = words(text_a);
            sets_b
                .iter()
                .map(|set_b| {
                    if set_a.is_empty() || set_b.is_empty() {
                        return 0.0;
                    }
                    let intersection = set_a.intersection(set_b).count();
                    let union = set_a.union(set_b).count();
                    #[allow(clippy::cast_precision_loss)]
                    if union == 0 {
                        0.0
                    } else {
                        intersection as f32 / union as f32
                    }
                })
                .collect()
        })
        .collect()
}

/// Topic inference: joined last two heading-hierarchy levels when
/// consistent, else the section heading, else the first five words.
fn infer_topic(
    anchor: &crate::core::DocChunk,
    partner: Option<&crate::core::DocChunk>,
) -> String {
    let hierarchy_topic = |chunk: &crate::core::DocChunk| -> Option<String> {
        if chunk.heading_hierarchy.is_empty() {
            return None;
        }
        let start = chunk.heading_hierarchy.len().saturating_sub(2);
        Some(chunk.heading_hierarchy[start..].join(" > "))
    };

    if let Some(topic_a) = hierarchy_topic(anchor) {
        if let Some(partner) = partner
            && let Some(topic_b) = hierarchy_topic(partner)
            && topic_a == topic_b
        {
            return topic_a;
        }
        return topic_a;
    }
    if let Some(partner) = partner
        && let Some(topic) = hierarchy_topic(partner)
    {
        return topic;
    }

    if let Some(heading) = anchor.section_heading.as_deref().map(str::trim)
        && !heading.is_empty()
    {
        return heading.to_string();
    }
    if let Some(heading) = partner
        .and_then(|p| p.section_heading.as_deref())
        .map(str::trim)
        && !heading.is_empty()
    {
        return heading.to_string();
    }

    let words: Vec<&str> = anchor.text.split_whitespace().take(5).collect();
    if words.len() >= 5 {
        format!("{}...", words.join(" "))
    } else {
        words.join(" ")
    }
}

/// Chunks not consumed by any pair or cluster, per document.
fn collect_unpaired(
    doc_chunks: &[(String, Vec<RetrievedChunk>)],
    pairs: &[ChunkPair],
    clusters: &[ChunkCluster],
) -> BTreeMap<String, Vec<RetrievedChunk>> {
    let mut used: HashSet<(String, String)> = HashSet::new();
    if let Some((doc_a, _)) = doc_chunks.first() {
        for pair in pairs {
            used.insert((doc_a.clone(), pair.chunk_a.chunk.chunk_id.clone()));
        }
    }
    if let Some((doc_b, _)) = doc_chunks.get(1) {
        for pair in pairs {
            used.insert((doc_b.clone(), pair.chunk_b.chunk.chunk_id.clone()));
        }
    }
    for cluster in clusters {
        for (doc_id, chunk) in &cluster.chunks {
            used.insert((doc_id.clone(), chunk.chunk.chunk_id.clone()));
        }
    }

    let mut unpaired = BTreeMap::new();
    for (doc_id, chunks) in doc_chunks {
        let remaining: Vec<RetrievedChunk> = chunks
            .iter()
            .filter(|c| !used.contains(&(doc_id.clone(), c.chunk.chunk_id.clone())))
            .cloned()
            .collect();
        unpaired.insert(doc_id.clone(), remaining);
    }
    unpaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkKind, DocChunk, DocChunkBuilder, Document};
    use crate::embedding::{DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder};
    use crate::storage::SqliteStore;

    fn doc_chunk(doc: &str, section: &str, heading: Option<&str>, text: &str) -> DocChunk {
        DocChunkBuilder::new(doc, section, 1, ChunkKind::Narrative)
            .text(text.to_string())
            .section_heading(heading.map(str::to_string))
            .build()
    }

    fn retrieved(chunk: DocChunk, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            rowid: 0,
            chunk,
            hybrid_score: f64::from(score),
            semantic_score: None,
            bm25_score: None,
            rerank_score: Some(score),
            compressed_text: None,
            expanded: false,
        }
    }

    fn setup_retriever(docs: &[(&str, &[&str])]) -> (ComparisonRetriever, Vec<String>) {
        let mut store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS));

        let mut ids = Vec::new();
        for (name, texts) in docs {
            let doc = Document::new("u1", "org1", name, name.as_bytes());
            store.insert_document(&doc).unwrap();
            let chunks: Vec<DocChunk> = texts
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    doc_chunk(&doc.id, &format!("sec_{i}"), Some("Cap Rate"), text)
                })
                .collect();
            let rowids = store.add_chunks(&chunks).unwrap();
            let embeddings: Vec<(i64, Vec<f32>)> = chunks
                .iter()
                .zip(&rowids)
                .map(|(c, r)| (*r, embedder.embed(&c.text).unwrap()))
                .collect();
            store.store_embeddings_batch(&embeddings, None).unwrap();
            ids.push(doc.id);
        }

        let store = crate::storage::shared(store);
        let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
        let comparison = ComparisonRetriever::new(
            store,
            retriever,
            Reranker::default(),
            10,
            0.6,
        );
        (comparison, ids)
    }

    #[tokio::test]
    async fn test_two_document_pairing() {
        let (comparison, ids) = setup_retriever(&[
            ("sunset.pdf", &["The cap rate for Sunset Plaza is 5.2 percent."]),
            ("ocean.pdf", &["The cap rate for Ocean View is 4.8 percent."]),
        ]);
        let context = comparison
            .retrieve_for_comparison("compare the cap rates", &ids, None)
            .await
            .unwrap();
        assert_eq!(context.num_documents, 2);
        assert_eq!(context.documents[0].label, "Document A");
        assert_eq!(context.documents[1].label, "Document B");
        assert_eq!(context.pairs.len(), 1);
        assert!(context.pairs[0].similarity >= 0.6);
        assert_eq!(context.pairs[0].topic, "Cap Rate");
        assert!(context.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_three_document_clustering() {
        let (comparison, ids) = setup_retriever(&[
            ("a.pdf", &["The cap rate of the property is 5.2 percent this year."]),
            ("b.pdf", &["The cap rate of the property is 4.8 percent this year."]),
            ("c.pdf", &["The cap rate of the property is 6.1 percent this year."]),
        ]);
        let context = comparison
            .retrieve_for_comparison("compare the cap rates of the deals", &ids, None)
            .await
            .unwrap();
        assert_eq!(context.num_documents, 3);
        assert!(context.pairs.is_empty());
        assert_eq!(context.clusters.len(), 1);
        let cluster = &context.clusters[0];
        assert_eq!(cluster.chunks.len(), 3);
        assert_eq!(cluster.topic, "Cap Rate");
        assert!(cluster.avg_similarity >= 0.6);
    }

    #[tokio::test]
    async fn test_unpaired_surfaced() {
        let (comparison, ids) = setup_retriever(&[
            (
                "a.pdf",
                &[
                    "The cap rate of the property is 5.2 percent.",
                    "Parking garage renovations were completed in 2022.",
                ],
            ),
            ("b.pdf", &["The cap rate of the property is 4.8 percent."]),
        ]);
        let context = comparison
            .retrieve_for_comparison("compare the cap rates", &ids, None)
            .await
            .unwrap();
        assert_eq!(context.pairs.len(), 1);
        let unpaired_a = &context.unpaired[&ids[0]];
        assert!(
            unpaired_a
                .iter()
                .any(|c| c.chunk.text.contains("Parking garage"))
        );
    }

    #[test]
    fn test_jaccard_matrix() {
        let a = vec!["the quick brown fox".to_string()];
        let b = vec![
            "the quick brown fox".to_string(),
            "completely different words".to_string(),
        ];
        let matrix = jaccard_matrix(&a, &b);
        assert!((matrix[0][0] - 1.0).abs() < 1e-6);
        assert!(matrix[0][1] < 0.01);
    }

    #[test]
    fn test_topic_inference_priority() {
        // Hierarchy first
        let mut a = doc_chunk("d1", "sec_1", Some("Financials"), "some text");
        a.heading_hierarchy = vec!["Financial Summary".to_string(), "Returns".to_string()];
        assert_eq!(infer_topic(&a, None), "Financial Summary > Returns");

        // Section heading next
        let b = doc_chunk("d1", "sec_1", Some("Cap Rate"), "some text");
        assert_eq!(infer_topic(&b, None), "Cap Rate");

        // First five words last
        let mut c = doc_chunk("d1", "sec_1", None, "one two three four five six");
        c.heading_hierarchy.clear();
        assert_eq!(infer_topic(&c, None), "one two three four five...");
    }

    #[test]
    fn test_event_payload_shape() {
        let pair = ChunkPair {
            chunk_a: retrieved(doc_chunk("d1", "sec_1", Some("Cap Rate"), "a text."), 0.9),
            chunk_b: retrieved(doc_chunk("d2", "sec_1", Some("Cap Rate"), "b text."), 0.9),
            similarity: 0.8,
            topic: "Cap Rate".to_string(),
        };
        let context = ComparisonContext {
            documents: vec![DocumentLabel {
                id: "d1".to_string(),
                filename: "a.pdf".to_string(),
                label: "Document A".to_string(),
            }],
            pairs: vec![pair],
            clusters: Vec::new(),
            unpaired: BTreeMap::new(),
            num_documents: 2,
        };
        let payload = context.to_event_payload();
        assert_eq!(payload["num_documents"], 2);
        assert_eq!(payload["pairs"][0]["topic"], "Cap Rate");
        assert!(payload["pairs"][0]["chunk_a"]["ref"].is_string());
    }
}
