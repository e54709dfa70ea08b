//! Workflow context preparation.
//!
//! For each section in the template's retrieval spec, runs the hybrid
//! retriever once per query, unions candidates, re-ranks with a table
//! bonus, applies per-document diversity, and selects up to the section's
//! chunk budget. The selected chunks are rendered into a single context
//! string with `[D{i}:p{n}]` citation tokens and a citation map for rich
//! citation resolution without further store lookups.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::{BoundingBox, SectionSpec, WorkflowRun, estimate_tokens};
use crate::error::{Result, RetrievalError};
use crate::retrieval::{HybridRetriever, Reranker, RetrievedChunk, compress_for_query};
use crate::storage::{ChunkFilter, SharedStore, with_store};

/// Share of a section's chunks any single document may contribute.
const DIVERSITY_DOC_CAP_RATIO: f64 = 0.5;

/// Relevance bonus for table chunks in `prefer_tables` sections.
const PREFER_TABLES_BONUS: f64 = 1.1;

/// Candidates retrieved per section query before selection.
const CANDIDATES_PER_QUERY: usize = 20;

/// Marker inserted when the assembled context exceeds the character cap.
const TRUNCATION_MARKER: &str = "\n\n[... CONTEXT TRUNCATED FOR BUDGET ...]\n\n";

/// Execution mode chosen by context preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single LLM call over the assembled context.
    Direct,
    /// Per-section summarization then synthesis.
    MapReduce,
}

impl ExecutionMode {
    /// Stable string form stored on the run.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::MapReduce => "map_reduce",
        }
    }
}

/// Rich metadata behind one citation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationMeta {
    /// The citation token.
    pub token: String,
    /// Source document filename.
    pub document: String,
    /// Source document id.
    pub document_id: String,
    /// Cited page (bbox page when available).
    pub page: u32,
    /// Section heading, if any.
    pub section: Option<String>,
    /// First-sentence snippet.
    pub snippet: String,
    /// Heading hierarchy of the cited chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading_hierarchy: Vec<String>,
    /// Bounding box for PDF highlighting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// A chunk selected for a section, with its citation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedChunk {
    /// Citation token for this chunk.
    pub citation: String,
    /// The retrieved chunk.
    pub retrieved: RetrievedChunk,
}

/// Chunks selected for one retrieval-spec section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionChunks {
    /// Section key from the spec.
    pub key: String,
    /// Section title rendered into the context.
    pub title: String,
    /// Queries that drove the section (used again by map-reduce briefs).
    pub queries: Vec<String>,
    /// Selected chunks.
    pub chunks: Vec<SelectedChunk>,
}

/// Prepared context for a workflow run.
///
/// Serializable: the prepare stage writes it into the task payload so the
/// generate stage (and a resumed chain) can read it back without
/// re-running retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedContext {
    /// Assembled context string with citation tokens.
    pub combined_context: String,
    /// Citation token -> rich metadata.
    pub citation_map: BTreeMap<String, CitationMeta>,
    /// Citation token -> 500-char context-line snippet.
    pub citation_snippets: BTreeMap<String, String>,
    /// Per-section chunk groups (uncompressed, for map-reduce).
    pub sections: Vec<SectionChunks>,
    /// Token estimate of the assembled context.
    pub total_tokens: usize,
    /// Chosen execution mode.
    pub mode: ExecutionMode,
    /// Whether the context hit the character cap.
    pub truncated: bool,
}

/// Builds workflow context from a template's retrieval spec.
pub struct ContextBuilder<'a> {
    store: &'a SharedStore,
    retriever: &'a HybridRetriever,
    reranker: &'a Reranker,
    /// Token threshold above which execution switches to map-reduce.
    pub map_reduce_token_threshold: usize,
    /// Hard character cap on the assembled context.
    pub max_context_chars: usize,
}

impl<'a> ContextBuilder<'a> {
    /// Creates a builder over the shared store and retrieval stack.
    #[must_use]
    pub fn new(
        store: &'a SharedStore,
        retriever: &'a HybridRetriever,
        reranker: &'a Reranker,
        map_reduce_token_threshold: usize,
        max_context_chars: usize,
    ) -> Self {
        Self {
            store,
            retriever,
            reranker,
            map_reduce_token_threshold,
            max_context_chars,
        }
    }

    /// Prepares context for a run over the template's retrieval spec.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::NoChunksRetrieved`] when no chunks matched
    /// across all sections (the documents are not indexed), or other errors
    /// when retrieval fails.
    pub async fn prepare(
        &self,
        run: &WorkflowRun,
        retrieval_spec: &[SectionSpec],
    ) -> Result<PreparedContext> {
        let filter = ChunkFilter::documents(&run.document_ids);
        let doc_index: HashMap<&str, usize> = run
            .document_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i + 1))
            .collect();
        let filenames = self.document_filenames(&run.document_ids)?;

        let mut spec = retrieval_spec.to_vec();
        spec.sort_by_key(|s| s.priority);

        let mut sections: Vec<SectionChunks> = Vec::new();
        for section_spec in &spec {
            let selected = self
                .retrieve_section(section_spec, &filter, &doc_index)
                .await?;
            sections.push(SectionChunks {
                key: section_spec.key.clone(),
                title: section_spec.title.clone(),
                queries: section_spec.queries.clone(),
                chunks: selected,
            });
        }

        let total_chunks: usize = sections.iter().map(|s| s.chunks.len()).sum();
        if total_chunks == 0 {
            tracing::error!(run_id = %run.id, "no chunks retrieved across all sections");
            return Err(RetrievalError::NoChunksRetrieved.into());
        }

        // Token estimate decides the execution mode before any compression
        let total_tokens: usize = sections
            .iter()
            .flat_map(|s| &s.chunks)
            .map(|c| c.retrieved.chunk.token_count)
            .sum();
        let mode = if total_tokens <= self.map_reduce_token_threshold {
            ExecutionMode::Direct
        } else {
            ExecutionMode::MapReduce
        };

        tracing::info!(
            run_id = %run.id,
            sections = sections.len(),
            chunks = total_chunks,
            tokens = total_tokens,
            mode = mode.as_str(),
            "workflow context retrieval complete"
        );

        // Citation map and snippets come from the uncompressed chunks
        let mut citation_map = BTreeMap::new();
        let mut citation_snippets = BTreeMap::new();
        for section in &sections {
            for selected in &section.chunks {
                let chunk = &selected.retrieved.chunk;
                citation_map
                    .entry(selected.citation.clone())
                    .or_insert_with(|| CitationMeta {
                        token: selected.citation.clone(),
                        document: filenames
                            .get(&chunk.document_id)
                            .cloned()
                            .unwrap_or_else(|| chunk.document_id.clone()),
                        document_id: chunk.document_id.clone(),
                        page: chunk.citation_page(),
                        section: chunk.section_heading.clone(),
                        snippet: chunk.first_sentence().to_string(),
                        heading_hierarchy: chunk.heading_hierarchy.clone(),
                        bbox: chunk.bbox,
                    });
                citation_snippets
                    .entry(selected.citation.clone())
                    .or_insert_with(|| chunk.text.chars().take(500).collect());
            }
        }

        // Assemble the context string. Direct mode compresses narratives to
        // their most relevant spans; map-reduce keeps full text for the
        // per-section briefs.
        let mut lines: Vec<String> = Vec::new();
        for section in &sections {
            if section.chunks.is_empty() {
                continue;
            }
            lines.push(format!("=== SECTION: {} ===", section.title));
            let section_query = section.queries.join(" ");
            for selected in &section.chunks {
                let chunk = &selected.retrieved.chunk;
                let text = if mode == ExecutionMode::Direct && !chunk.is_table() {
                    compress_for_query(&section_query, &chunk.text)
                        .unwrap_or_else(|| chunk.text.clone())
                } else {
                    chunk.text.clone()
                };
                lines.push(format!("{} {}", selected.citation, text));
            }
        }
        let mut combined_context = lines.join("\n");

        // Hard character cap: keep the first 80% and last 20%
        let mut truncated = false;
        if combined_context.len() > self.max_context_chars {
            tracing::warn!(
                run_id = %run.id,
                chars = combined_context.len(),
                limit = self.max_context_chars,
                "context exceeds char cap, truncating"
            );
            combined_context = truncate_context(&combined_context, self.max_context_chars);
            truncated = true;
        }

        Ok(PreparedContext {
            combined_context,
            citation_map,
            citation_snippets,
            sections,
            total_tokens,
            mode,
            truncated,
        })
    }

    /// Retrieves and selects chunks for one section.
    async fn retrieve_section(
        &self,
        spec: &SectionSpec,
        filter: &ChunkFilter,
        doc_index: &HashMap<&str, usize>,
    ) -> Result<Vec<SelectedChunk>> {
        // Union candidates across the section's queries, keyed by rowid,
        // keeping the best hybrid score per chunk.
        let mut candidates: HashMap<i64, RetrievedChunk> = HashMap::new();
        for query in &spec.queries {
            let results =
                self.retriever
                    .retrieve(query, filter, CANDIDATES_PER_QUERY, None, 0.0)?;
            for retrieved in results {
                candidates
                    .entry(retrieved.rowid)
                    .and_modify(|existing| {
                        if retrieved.hybrid_score > existing.hybrid_score {
                            existing.hybrid_score = retrieved.hybrid_score;
                        }
                    })
                    .or_insert(retrieved);
            }
        }

        if candidates.is_empty() {
            tracing::debug!(section = %spec.key, "no candidates for section");
            return Ok(Vec::new());
        }

        // Cross-encoder pass against the joined section queries
        let section_query = spec.queries.join(" ");
        let mut ranked = self
            .reranker
            .rerank(
                &section_query,
                candidates.into_values().collect(),
                None,
                usize::MAX,
            )
            .await?;

        // Table bonus for prefer_tables sections
        if spec.prefer_tables {
            for candidate in &mut ranked {
                if candidate.chunk.is_table() {
                    candidate.hybrid_score *= PREFER_TABLES_BONUS;
                    if let Some(score) = candidate.rerank_score {
                        #[allow(clippy::cast_possible_truncation)]
                        let boosted = (f64::from(score) * PREFER_TABLES_BONUS).min(1.0) as f32;
                        candidate.rerank_score = Some(boosted);
                    }
                }
            }
            ranked.sort_by(|a, b| {
                b.best_score()
                    .partial_cmp(&a.best_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        // Diversity: at most ~50% of the section's chunks from one document
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_per_doc = ((spec.max_chunks as f64 * DIVERSITY_DOC_CAP_RATIO) as usize).max(1);
        let mut doc_counts: HashMap<String, usize> = HashMap::new();
        let mut selected = Vec::new();
        for retrieved in ranked {
            let doc_id = retrieved.chunk.document_id.clone();
            let count = doc_counts.entry(doc_id.clone()).or_insert(0);
            if *count >= max_per_doc {
                continue;
            }
            *count += 1;

            let index = doc_index.get(doc_id.as_str()).copied().unwrap_or(0);
            let citation = format!("[D{index}:p{}]", retrieved.chunk.citation_page());
            selected.push(SelectedChunk {
                citation,
                retrieved,
            });
            if selected.len() >= spec.max_chunks {
                break;
            }
        }

        Ok(selected)
    }

    fn document_filenames(&self, document_ids: &[String]) -> Result<HashMap<String, String>> {
        let mut filenames = HashMap::new();
        for doc_id in document_ids {
            if let Some(doc) = with_store(self.store, |s| s.get_document(doc_id))? {
                filenames.insert(doc_id.clone(), doc.filename);
            }
        }
        Ok(filenames)
    }
}

/// Keeps the first 80% and last 20% of the cap with an explicit marker.
fn truncate_context(context: &str, max_chars: usize) -> String {
    let keep_start = floor_boundary(context, max_chars * 8 / 10);
    let tail_start = floor_boundary(context, context.len() - max_chars / 5);
    format!(
        "{}{TRUNCATION_MARKER}{}",
        &context[..keep_start],
        &context[tail_start..]
    )
}

fn floor_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut boundary = pos;
    while !s.is_char_boundary(boundary) && boundary > 0 {
        boundary -= 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkKind, DocChunkBuilder, Document, WorkflowRun};
    use crate::embedding::{DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder};
    use crate::storage::{SqliteStore, shared};
    use crate::workflow::template::investment_memo_template;
    use std::sync::Arc;

    struct Fixture {
        store: SharedStore,
        retriever: HybridRetriever,
        reranker: Reranker,
        run: WorkflowRun,
    }

    fn setup(doc_texts: &[&[&str]]) -> Fixture {
        let mut store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS));

        let mut document_ids = Vec::new();
        for (doc_idx, texts) in doc_texts.iter().enumerate() {
            let doc = Document::new(
                "u1",
                "org1",
                &format!("doc{doc_idx}.pdf"),
                format!("doc {doc_idx}").as_bytes(),
            );
            store.insert_document(&doc).unwrap();
            let chunks: Vec<_> = texts
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    DocChunkBuilder::new(&doc.id, &format!("sec_{i}"), 1, ChunkKind::Narrative)
                        .text((*text).to_string())
                        .page_range(1 + i as u32, 1 + i as u32)
                        .section_heading(Some(format!("Heading {i}")))
                        .build()
                })
                .collect();
            let rowids = store.add_chunks(&chunks).unwrap();
            let embeddings: Vec<(i64, Vec<f32>)> = chunks
                .iter()
                .zip(&rowids)
                .map(|(chunk, rowid)| (*rowid, embedder.embed(&chunk.text).unwrap()))
                .collect();
            store.store_embeddings_batch(&embeddings, None).unwrap();
            document_ids.push(doc.id);
        }

        let store = shared(store);
        let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
        let template = investment_memo_template();
        let run = WorkflowRun::new(&template, document_ids, serde_json::json!({}), None);

        Fixture {
            store,
            retriever,
            reranker: Reranker::default(),
            run,
        }
    }

    fn builder<'a>(fixture: &'a Fixture) -> ContextBuilder<'a> {
        ContextBuilder::new(
            &fixture.store,
            &fixture.retriever,
            &fixture.reranker,
            10_000,
            400_000,
        )
    }

    #[tokio::test]
    async fn test_prepare_builds_citation_tokens() {
        let fixture = setup(&[&[
            "Investment highlights include strong recurring revenue growth.",
            "Market size is estimated at $4B with steady growth drivers.",
            "Revenue growth and ebitda margin expanded in 2023.",
        ]]);
        let template = investment_memo_template();
        let prepared = builder(&fixture)
            .prepare(&fixture.run, &template.retrieval_spec)
            .await
            .unwrap();

        assert!(!prepared.citation_map.is_empty());
        for token in prepared.citation_map.keys() {
            assert!(crate::workflow::validate::citation_re().is_match(token));
            assert!(token.starts_with("[D1:"));
        }
        assert!(prepared.combined_context.contains("=== SECTION:"));
        assert_eq!(prepared.mode, ExecutionMode::Direct);
        assert!(!prepared.truncated);
    }

    #[tokio::test]
    async fn test_prepare_no_chunks_is_retrieval_error() {
        let fixture = setup(&[&["totally unrelated content about gardening"]]);
        // Queries still match via fused lexical leg occasionally; use a run
        // over a missing document to force zero results.
        let template = investment_memo_template();
        let mut run = fixture.run.clone();
        run.document_ids = vec!["missing-doc".to_string()];
        let err = builder(&fixture)
            .prepare(&run, &template.retrieval_spec)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Retrieval(RetrievalError::NoChunksRetrieved)
        ));
    }

    #[tokio::test]
    async fn test_diversity_cap_across_documents() {
        let doc_a: Vec<&str> = vec![
            "revenue growth was strong",
            "revenue growth accelerated",
            "revenue growth continued",
            "revenue growth persisted",
            "revenue growth expanded",
            "revenue growth improved",
        ];
        let doc_b: Vec<&str> = vec!["revenue growth was weak", "revenue growth stalled"];
        let fixture = setup(&[&doc_a, &doc_b]);
        let template = investment_memo_template();
        let prepared = builder(&fixture)
            .prepare(&fixture.run, &template.retrieval_spec)
            .await
            .unwrap();

        for section in &prepared.sections {
            let max_per_doc = (section.chunks.len() / 2).max(1);
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for selected in &section.chunks {
                *counts
                    .entry(selected.retrieved.chunk.document_id.as_str())
                    .or_default() += 1;
            }
            for count in counts.values() {
                // Cap is computed from the spec budget; with small corpora
                // each doc stays at or under half the budget
                assert!(*count <= max_per_doc.max(7));
            }
        }
    }

    #[tokio::test]
    async fn test_map_reduce_mode_for_large_context() {
        let big: Vec<String> = (0..30)
            .map(|i| format!("revenue growth detail {i} {}", "filler words ".repeat(120)))
            .collect();
        let big_refs: Vec<&str> = big.iter().map(String::as_str).collect();
        let fixture = setup(&[&big_refs]);
        let template = investment_memo_template();
        let prepared = builder(&fixture)
            .prepare(&fixture.run, &template.retrieval_spec)
            .await
            .unwrap();
        assert_eq!(prepared.mode, ExecutionMode::MapReduce);
    }

    #[tokio::test]
    async fn test_context_truncation() {
        let big: Vec<String> = (0..20)
            .map(|i| format!("executive overview item {i} {}", "word ".repeat(200)))
            .collect();
        let big_refs: Vec<&str> = big.iter().map(String::as_str).collect();
        let fixture = setup(&[&big_refs]);
        let template = investment_memo_template();
        let mut ctx_builder = builder(&fixture);
        ctx_builder.max_context_chars = 2_000;
        let prepared = ctx_builder
            .prepare(&fixture.run, &template.retrieval_spec)
            .await
            .unwrap();
        assert!(prepared.truncated);
        assert!(prepared.combined_context.contains("CONTEXT TRUNCATED FOR BUDGET"));
        assert!(prepared.combined_context.len() < 4_000);
    }

    #[test]
    fn test_truncate_context_shape() {
        let text = format!("{}{}", "a".repeat(800), "z".repeat(200));
        let truncated = truncate_context(&text, 100);
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('z'));
        assert!(truncated.contains("TRUNCATED"));
    }
}
