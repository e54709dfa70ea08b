//! Section-based chunking of parser output.
//!
//! Transforms page-wise parser output into retrieval chunks:
//!
//! 1. Paragraphs are grouped by section heading.
//! 2. Sections within the token budget become one narrative chunk; larger
//!    sections split at paragraph boundaries into continuation chunks.
//! 3. Tables become separate `table` chunks, bidirectionally linked to the
//!    nearest preceding narrative chunk.
//! 4. Key-value pairs pack into `key_value` chunks with per-pair bounding
//!    boxes.
//! 5. Unstructured documents (single section, no heading, oversize) fall
//!    back to sentence-boundary splitting.
//! 6. A final pass populates sibling ids per section.

mod section;
mod table;

pub use section::split_sentences;

use crate::core::{ChunkKind, DocChunk};
use crate::error::{ChunkingError, Result};
use crate::parse::ParserOutput;

/// Configuration for the section chunker.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Maximum tokens per narrative chunk.
    pub max_tokens: usize,
    /// Whether to link table chunks to narrative chunks bidirectionally.
    pub link_tables_to_narrative: bool,
    /// Maximum key-value pairs packed into one chunk.
    pub max_kv_pairs_per_chunk: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: crate::config::DEFAULT_CHUNK_MAX_TOKENS,
            link_tables_to_narrative: true,
            max_kv_pairs_per_chunk: 100,
        }
    }
}

/// Section-based document chunker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionChunker {
    config: ChunkerConfig,
}

impl SectionChunker {
    /// Creates a chunker with the given configuration.
    #[must_use]
    pub const fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunks parser output for a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the parser output has no pages or the document
    /// yields no chunks.
    pub fn chunk(&self, document_id: &str, output: &ParserOutput) -> Result<Vec<DocChunk>> {
        if output.pages.is_empty() {
            return Err(ChunkingError::MissingStructure {
                what: "pages".to_string(),
            }
            .into());
        }

        let groups = section::group_by_sections(output);
        tracing::info!(
            document_id,
            sections = groups.len(),
            pages = output.page_count,
            "section grouping complete"
        );

        // A single heading-less oversize section means the document has no
        // usable structure (plain Word export, OCR dump).
        let unstructured = groups.len() == 1
            && groups[0].heading.is_none()
            && groups[0].total_tokens > self.config.max_tokens;

        let mut narrative_chunks = if unstructured {
            tracing::warn!(
                document_id,
                tokens = groups[0].total_tokens,
                "document appears unstructured, using sentence-based fallback"
            );
            section::fallback_chunks(document_id, &groups[0], self.config.max_tokens)
        } else {
            let mut chunks = Vec::new();
            for group in &groups {
                chunks.extend(section::chunk_section(
                    document_id,
                    group,
                    self.config.max_tokens,
                ));
            }
            chunks
        };

        let table_chunks = table::table_chunks(
            document_id,
            output,
            &mut narrative_chunks,
            self.config.link_tables_to_narrative,
        );
        let kv_chunks = table::key_value_chunks(
            document_id,
            &output.key_value_pairs,
            self.config.max_kv_pairs_per_chunk,
        );

        let mut all_chunks = narrative_chunks;
        all_chunks.extend(table_chunks);
        all_chunks.extend(kv_chunks);

        if all_chunks.is_empty() {
            return Err(ChunkingError::EmptyOutput {
                document_id: document_id.to_string(),
            }
            .into());
        }

        for (index, chunk) in all_chunks.iter_mut().enumerate() {
            chunk.chunk_index = index;
        }
        populate_siblings(&mut all_chunks);

        tracing::info!(
            document_id,
            total = all_chunks.len(),
            narrative = all_chunks.iter().filter(|c| c.kind == ChunkKind::Narrative).count(),
            tables = all_chunks.iter().filter(|c| c.kind == ChunkKind::Table).count(),
            key_value = all_chunks.iter().filter(|c| c.kind == ChunkKind::KeyValue).count(),
            "chunking complete"
        );

        Ok(all_chunks)
    }
}

/// Populates `sibling_chunk_ids` for all chunks sharing a section.
fn populate_siblings(chunks: &mut [DocChunk]) {
    use std::collections::HashMap;

    let mut by_section: HashMap<String, Vec<String>> = HashMap::new();
    for chunk in chunks.iter() {
        by_section
            .entry(chunk.section_id.clone())
            .or_default()
            .push(chunk.chunk_id.clone());
    }

    for chunk in chunks.iter_mut() {
        if let Some(ids) = by_section.get(&chunk.section_id) {
            chunk.sibling_chunk_ids = ids.clone();
        }
    }
}
