//! Context expansion over linked chunks.
//!
//! Re-ranked chunks above a score floor pull in their structurally linked
//! neighbours (continuation parent, linked narrative/table, siblings).
//! Expanded chunks inherit a derived score slightly below their parent so
//! they sort after it; the merged list is re-sorted and capped by query
//! type.

use std::collections::HashSet;

use super::RetrievedChunk;
use crate::error::Result;
use crate::storage::{SharedStore, with_store};

/// Score multiplier for expanded chunks relative to their parent.
const DERIVED_SCORE_FACTOR: f64 = 0.95;

/// Expands high-scoring chunks with their linked neighbours.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextExpander;

impl ContextExpander {
    /// Expands `chunks`, fetching up to `max_per_chunk` linked chunks for
    /// every chunk whose rerank score is at or above `rerank_floor`.
    /// Chunks below the floor pass through unexpanded. The merged result is
    /// sorted by score and truncated to `max_total`.
    ///
    /// # Errors
    ///
    /// Returns an error if chunk lookups fail.
    pub fn expand(
        self,
        store: &SharedStore,
        chunks: Vec<RetrievedChunk>,
        rerank_floor: f32,
        max_per_chunk: usize,
        max_total: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if chunks.is_empty() || max_per_chunk == 0 {
            return Ok(chunks);
        }

        let mut seen: HashSet<(String, String)> = chunks
            .iter()
            .map(|c| (c.chunk.document_id.clone(), c.chunk.chunk_id.clone()))
            .collect();

        let mut expanded: Vec<RetrievedChunk> = Vec::new();

        for candidate in &chunks {
            let score = candidate.rerank_score.unwrap_or(0.0);
            if score < rerank_floor {
                continue;
            }

            let derived_score = candidate.best_score() * DERIVED_SCORE_FACTOR;
            let mut fetched = 0usize;

            for linked_id in Self::linked_ids(candidate) {
                if fetched >= max_per_chunk {
                    break;
                }
                let key = (candidate.chunk.document_id.clone(), linked_id.clone());
                if seen.contains(&key) {
                    continue;
                }

                let row = with_store(store, |s| {
                    s.get_chunk(&candidate.chunk.document_id, &linked_id)
                })?;
                let Some(row) = row else { continue };

                seen.insert(key);
                fetched += 1;
                #[allow(clippy::cast_possible_truncation)]
                let derived_rerank = derived_score as f32;
                expanded.push(RetrievedChunk {
                    rowid: row.rowid,
                    chunk: row.chunk,
                    hybrid_score: derived_score,
                    semantic_score: None,
                    bm25_score: None,
                    rerank_score: Some(derived_rerank),
                    compressed_text: None,
                    expanded: true,
                });
            }
        }

        let expanded_count = expanded.len();
        let mut merged = chunks;
        merged.extend(expanded);
        merged.sort_by(|a, b| {
            b.best_score()
                .partial_cmp(&a.best_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(max_total);

        tracing::debug!(
            expanded = expanded_count,
            total = merged.len(),
            "context expansion complete"
        );
        Ok(merged)
    }

    /// Linked chunk ids in fetch-priority order: continuation parent first,
    /// then narrative/table links, then section siblings.
    fn linked_ids(candidate: &RetrievedChunk) -> Vec<String> {
        let chunk = &candidate.chunk;
        let mut ids: Vec<String> = Vec::new();

        if let Some(ref parent) = chunk.parent_chunk_id {
            ids.push(parent.clone());
        }
        if let Some(ref narrative) = chunk.linked_narrative_id {
            ids.push(narrative.clone());
        }
        ids.extend(chunk.linked_table_ids.iter().cloned());
        for sibling in &chunk.sibling_chunk_ids {
            if sibling != &chunk.chunk_id {
                ids.push(sibling.clone());
            }
        }

        // De-dup while preserving priority order
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkKind, DocChunk, DocChunkBuilder, Document};
    use crate::storage::{SqliteStore, shared};

    fn retrieved(chunk: DocChunk, rowid: i64, rerank_score: f32) -> RetrievedChunk {
        RetrievedChunk {
            rowid,
            chunk,
            hybrid_score: f64::from(rerank_score),
            semantic_score: None,
            bm25_score: None,
            rerank_score: Some(rerank_score),
            compressed_text: None,
            expanded: false,
        }
    }

    fn setup() -> (SharedStore, Document) {
        let mut store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        let doc = Document::new("u1", "org1", "doc.pdf", b"expand test");
        store.insert_document(&doc).unwrap();
        (shared(store), doc)
    }

    #[test]
    fn test_expands_continuation_parent() {
        let (store, doc) = setup();
        let first = DocChunkBuilder::new(&doc.id, "sec_1", 1, ChunkKind::Narrative)
            .text("first part".to_string())
            .build();
        let second = DocChunkBuilder::new(&doc.id, "sec_1", 2, ChunkKind::Narrative)
            .text("second part".to_string())
            .continuation(first.chunk_id.clone())
            .build();
        let rowids = with_store(&store, |s| s.add_chunks(&[first, second.clone()])).unwrap();

        let result = ContextExpander
            .expand(&store, vec![retrieved(second, rowids[1], 0.9)], 0.5, 2, 10)
            .unwrap();

        assert_eq!(result.len(), 2);
        let parent = result.iter().find(|c| c.expanded).unwrap();
        assert_eq!(parent.chunk.chunk_id, "sec_1_1_para");
        // Derived score sits just below its parent
        let original = result.iter().find(|c| !c.expanded).unwrap();
        assert!(parent.best_score() < original.best_score());
    }

    #[test]
    fn test_below_floor_not_expanded() {
        let (store, doc) = setup();
        let first = DocChunkBuilder::new(&doc.id, "sec_1", 1, ChunkKind::Narrative)
            .text("first".to_string())
            .build();
        let second = DocChunkBuilder::new(&doc.id, "sec_1", 2, ChunkKind::Narrative)
            .text("second".to_string())
            .continuation(first.chunk_id.clone())
            .build();
        let rowids = with_store(&store, |s| s.add_chunks(&[first, second.clone()])).unwrap();

        let result = ContextExpander
            .expand(&store, vec![retrieved(second, rowids[1], 0.2)], 0.5, 2, 10)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(!result[0].expanded);
    }

    #[test]
    fn test_max_total_cap() {
        let (store, doc) = setup();
        let mut chunks = Vec::new();
        for seq in 1..=4 {
            chunks.push(
                DocChunkBuilder::new(&doc.id, "sec_1", seq, ChunkKind::Narrative)
                    .text(format!("part {seq}"))
                    .build(),
            );
        }
        // Give every chunk the full sibling list, as the chunker does
        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        for chunk in &mut chunks {
            chunk.sibling_chunk_ids = ids.clone();
        }
        let rowids = with_store(&store, |s| s.add_chunks(&chunks)).unwrap();

        let result = ContextExpander
            .expand(
                &store,
                vec![retrieved(chunks[0].clone(), rowids[0], 0.9)],
                0.5,
                3,
                2,
            )
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_no_duplicate_expansion() {
        let (store, doc) = setup();
        let narrative = DocChunkBuilder::new(&doc.id, "sec_1", 1, ChunkKind::Narrative)
            .text("narrative".to_string())
            .build();
        let rowids = with_store(&store, |s| s.add_chunks(&[narrative.clone()])).unwrap();

        // Two retrieved copies pointing at the same sibling set
        let a = retrieved(narrative.clone(), rowids[0], 0.9);
        let b = retrieved(narrative, rowids[0], 0.8);
        let result = ContextExpander.expand(&store, vec![a, b], 0.5, 2, 10).unwrap();
        // Nothing new to fetch; both originals survive
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|c| !c.expanded));
    }
}
