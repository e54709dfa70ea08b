//! Table and key-value chunk construction.

use crate::core::{BoundingBox, ChunkKind, DocChunk, DocChunkBuilder, KeyValuePair};
use crate::parse::{ParagraphRole, ParsedKeyValue, ParserOutput};

/// Creates table chunks from page tables, linking each to the nearest
/// preceding narrative chunk (and back, when linking is enabled).
pub(crate) fn table_chunks(
    document_id: &str,
    output: &ParserOutput,
    narrative_chunks: &mut [DocChunk],
    link_to_narrative: bool,
) -> Vec<DocChunk> {
    let mut chunks = Vec::new();
    let mut table_counter = 0usize;

    for page in &output.pages {
        let page_num = page.page_number;
        for table in &page.tables {
            table_counter += 1;

            let preceding =
                find_preceding_narrative(page_num, narrative_chunks).map(|i| {
                    (i, narrative_chunks[i].chunk_id.clone())
                });

            let table_text = format!("[Table {table_counter}]\n{}", table.text);
            let context = page
                .paragraphs_by_role
                .get(&ParagraphRole::Content)
                .and_then(|paras| paras.first())
                .map(|p| truncate_chars(&p.content, 200));

            let mut builder = DocChunkBuilder::new(
                document_id,
                &format!("page_{page_num}"),
                table_counter,
                ChunkKind::Table,
            )
            .text(table_text)
            .table(table.cells.clone().unwrap_or_else(|| {
                serde_json::Value::String(table.text.clone())
            }))
            .page_range(page_num, page_num)
            .table_metadata(context, Some(table.row_count), Some(table.column_count))
            .bbox(BoundingBox::from_polygon(page_num, &table.polygon));

            if let Some((_, ref narrative_id)) = preceding {
                builder = builder.linked_narrative(narrative_id.clone());
            }

            let chunk = builder.build();

            if link_to_narrative
                && let Some((idx, _)) = preceding
            {
                narrative_chunks[idx].linked_table_ids.push(chunk.chunk_id.clone());
            }

            chunks.push(chunk);
        }
    }

    chunks
}

/// Packs key-value pairs into chunks of at most `max_per_chunk` pairs,
/// preserving a per-pair bounding box for UI highlighting.
pub(crate) fn key_value_chunks(
    document_id: &str,
    pairs: &[ParsedKeyValue],
    max_per_chunk: usize,
) -> Vec<DocChunk> {
    if pairs.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for (group_index, group) in pairs.chunks(max_per_chunk.max(1)).enumerate() {
        let enriched: Vec<KeyValuePair> = group
            .iter()
            .map(|kv| KeyValuePair {
                key: kv.key.clone(),
                value: kv.value.clone(),
                page_number: kv.page_number,
                bbox: BoundingBox::from_polygon(kv.page_number, &kv.polygon),
            })
            .collect();

        let text_lines: Vec<String> = enriched
            .iter()
            .filter(|kv| !kv.key.is_empty())
            .map(|kv| {
                if kv.value.is_empty() {
                    format!("{}:", kv.key)
                } else {
                    format!("{}: {}", kv.key, kv.value)
                }
            })
            .collect();

        let pages: Vec<u32> = enriched.iter().map(|kv| kv.page_number).collect();
        let page_start = pages.iter().copied().min().unwrap_or(1);
        let page_end = pages.iter().copied().max().unwrap_or(1);

        let chunk = DocChunkBuilder::new(document_id, "kv_chunk", group_index, ChunkKind::KeyValue)
            .text(text_lines.join("\n"))
            .page_range(page_start, page_end)
            .key_value_pairs(enriched)
            .build();
        chunks.push(chunk);
    }

    chunks
}

/// Finds the index of the narrative chunk preceding a page.
fn find_preceding_narrative(page_num: u32, narrative_chunks: &[DocChunk]) -> Option<usize> {
    narrative_chunks
        .iter()
        .rposition(|c| c.page_number <= page_num)
}

/// Truncates a string to at most `max` characters on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::make_chunk_id;

    #[test]
    fn test_kv_chunk_ids() {
        let pairs: Vec<ParsedKeyValue> = (0..3)
            .map(|i| ParsedKeyValue {
                key: format!("K{i}"),
                value: "v".to_string(),
                page_number: 1,
                polygon: Vec::new(),
            })
            .collect();
        let chunks = key_value_chunks("doc-1", &pairs, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, make_chunk_id("kv_chunk", 0, ChunkKind::KeyValue));
        assert_eq!(chunks[1].chunk_id, make_chunk_id("kv_chunk", 1, ChunkKind::KeyValue));
    }

    #[test]
    fn test_kv_page_range_spans_group() {
        let pairs = vec![
            ParsedKeyValue {
                key: "A".to_string(),
                value: "1".to_string(),
                page_number: 2,
                polygon: Vec::new(),
            },
            ParsedKeyValue {
                key: "B".to_string(),
                value: "2".to_string(),
                page_number: 5,
                polygon: Vec::new(),
            },
        ];
        let chunks = key_value_chunks("doc-1", &pairs, 100);
        assert_eq!(chunks[0].page_range, (2, 5));
        assert_eq!(chunks[0].page_number, 2);
    }

    #[test]
    fn test_kv_empty_value_renders_key_only() {
        let pairs = vec![ParsedKeyValue {
            key: "Signature".to_string(),
            value: String::new(),
            page_number: 1,
            polygon: Vec::new(),
        }];
        let chunks = key_value_chunks("doc-1", &pairs, 100);
        assert_eq!(chunks[0].text, "Signature:");
    }

    #[test]
    fn test_no_pairs_no_chunks() {
        assert!(key_value_chunks("doc-1", &[], 100).is_empty());
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        let s = "é".repeat(10);
        assert_eq!(truncate_chars(&s, 3).chars().count(), 3);
    }
}
