//! Section grouping and narrative chunk construction.

use crate::core::{BoundingBox, ChunkKind, DocChunk, DocChunkBuilder, estimate_tokens};
use crate::parse::{ParagraphRole, ParserOutput};

/// A group of paragraphs under one section heading.
#[derive(Debug, Clone)]
pub(crate) struct SectionGroup {
    /// Section identifier (`sec_0` for content before the first heading).
    pub section_id: String,
    /// Heading text, if the section has one.
    pub heading: Option<String>,
    /// Paragraph texts with the page each appeared on.
    pub paragraphs: Vec<(u32, String, Vec<f64>)>,
    /// Inclusive page range.
    pub page_range: (u32, u32),
    /// Estimated token total across paragraphs.
    pub total_tokens: usize,
}

impl SectionGroup {
    fn recompute_tokens(&mut self) {
        self.total_tokens = self
            .paragraphs
            .iter()
            .map(|(_, text, _)| estimate_tokens(text))
            .sum();
    }
}

/// Groups paragraphs into sections using the `sectionHeading` role.
///
/// A heading opens a new section; content paragraphs attach to the current
/// one. Title paragraphs attach only while no heading has been seen.
pub(crate) fn group_by_sections(output: &ParserOutput) -> Vec<SectionGroup> {
    let mut groups: Vec<SectionGroup> = Vec::new();
    let mut current = SectionGroup {
        section_id: "sec_0".to_string(),
        heading: None,
        paragraphs: Vec::new(),
        page_range: (1, 1),
        total_tokens: 0,
    };
    let mut saw_page = false;

    for page in &output.pages {
        let page_num = page.page_number;
        if saw_page {
            current.page_range.1 = page_num;
        } else {
            current.page_range = (page_num, page_num);
            saw_page = true;
        }

        if let Some(headings) = page.paragraphs_by_role.get(&ParagraphRole::SectionHeading)
            && let Some(first) = headings.first()
        {
            if !current.paragraphs.is_empty() {
                current.recompute_tokens();
                groups.push(current.clone());
            }
            let section_num = groups.len() + 1;
            current = SectionGroup {
                section_id: format!("sec_{section_num}"),
                heading: Some(first.content.clone()),
                paragraphs: Vec::new(),
                page_range: (page_num, page_num),
                total_tokens: 0,
            };
        }

        if let Some(content) = page.paragraphs_by_role.get(&ParagraphRole::Content) {
            for para in content {
                current
                    .paragraphs
                    .push((page_num, para.content.clone(), para.polygon.clone()));
            }
        }

        if current.heading.is_none()
            && let Some(titles) = page.paragraphs_by_role.get(&ParagraphRole::Title)
        {
            for para in titles {
                current
                    .paragraphs
                    .push((page_num, para.content.clone(), para.polygon.clone()));
            }
        }
    }

    if !current.paragraphs.is_empty() {
        current.recompute_tokens();
        groups.push(current);
    }

    groups
}

/// Chunks one section, splitting at paragraph boundaries when it exceeds
/// the token budget.
pub(crate) fn chunk_section(
    document_id: &str,
    section: &SectionGroup,
    max_tokens: usize,
) -> Vec<DocChunk> {
    if section.total_tokens <= max_tokens {
        return vec![narrative_chunk(document_id, section, &section.paragraphs, 1, 1, None)];
    }
    split_section(document_id, section, max_tokens)
}

fn split_section(document_id: &str, section: &SectionGroup, max_tokens: usize) -> Vec<DocChunk> {
    let mut chunks: Vec<DocChunk> = Vec::new();
    let mut current: Vec<(u32, String, Vec<f64>)> = Vec::new();
    let mut current_tokens = 0usize;

    for para in &section.paragraphs {
        let para_tokens = estimate_tokens(&para.1);
        if current_tokens + para_tokens > max_tokens && !current.is_empty() {
            let parent = chunks.last().map(|c: &DocChunk| c.chunk_id.clone());
            let chunk = narrative_chunk(
                document_id,
                section,
                &current,
                chunks.len() + 1,
                0,
                parent,
            );
            chunks.push(chunk);
            current = vec![para.clone()];
            current_tokens = para_tokens;
        } else {
            current.push(para.clone());
            current_tokens += para_tokens;
        }
    }

    if !current.is_empty() {
        let parent = chunks.last().map(|c| c.chunk_id.clone());
        let chunk = narrative_chunk(document_id, section, &current, chunks.len() + 1, 0, parent);
        chunks.push(chunk);
    }

    let total = chunks.len();
    for chunk in &mut chunks {
        chunk.total_in_section = total;
    }
    chunks
}

/// Builds a narrative chunk. The section heading is always rendered into
/// the text so continuations keep their context.
fn narrative_chunk(
    document_id: &str,
    section: &SectionGroup,
    paragraphs: &[(u32, String, Vec<f64>)],
    sequence: usize,
    total: usize,
    parent_chunk_id: Option<String>,
) -> DocChunk {
    let mut lines: Vec<&str> = Vec::new();
    if let Some(ref heading) = section.heading {
        lines.push(heading);
        lines.push("");
    }
    for (_, text, _) in paragraphs {
        if !text.is_empty() {
            lines.push(text);
        }
    }
    let text = lines.join("\n");

    let mut builder = DocChunkBuilder::new(
        document_id,
        &section.section_id,
        sequence,
        ChunkKind::Narrative,
    )
    .narrative_text(text.clone())
    .text(text)
    .page_range(section.page_range.0, section.page_range.1)
    .section_heading(section.heading.clone())
    .total_in_section(if total == 0 { 1 } else { total })
    .bbox(first_page_bbox(paragraphs));

    if sequence > 1
        && let Some(parent) = parent_chunk_id
    {
        builder = builder.continuation(parent);
    }

    builder.build()
}

/// Bounding box for a narrative chunk: union of the first page's paragraph
/// polygons only.
fn first_page_bbox(paragraphs: &[(u32, String, Vec<f64>)]) -> Option<BoundingBox> {
    let first_page = paragraphs.first().map(|(page, _, _)| *page)?;
    let mut merged: Option<BoundingBox> = None;
    for (page, _, polygon) in paragraphs {
        if *page != first_page {
            continue;
        }
        if let Some(bbox) = BoundingBox::from_polygon(first_page, polygon) {
            merged = Some(match merged {
                Some(existing) => existing.union(&bbox),
                None => bbox,
            });
        }
    }
    merged
}

/// Fallback chunking for unstructured documents: split at sentence
/// boundaries and regroup into token-budgeted chunks.
pub(crate) fn fallback_chunks(
    document_id: &str,
    section: &SectionGroup,
    max_tokens: usize,
) -> Vec<DocChunk> {
    let full_text = section
        .paragraphs
        .iter()
        .map(|(_, text, _)| text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let sentences = split_sentences(&full_text);

    let mut chunks: Vec<DocChunk> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0usize;

    let mut flush = |current: &mut Vec<&str>, chunks: &mut Vec<DocChunk>| {
        if current.is_empty() {
            return;
        }
        let text = current.join(" ");
        let parent = chunks.last().map(|c: &DocChunk| c.chunk_id.clone());
        let sequence = chunks.len() + 1;
        let mut builder = DocChunkBuilder::new(
            document_id,
            &section.section_id,
            sequence,
            ChunkKind::Narrative,
        )
        .narrative_text(text.clone())
        .text(text)
        .page_range(section.page_range.0, section.page_range.1)
        .section_heading(section.heading.clone());
        if sequence > 1
            && let Some(parent_id) = parent
        {
            builder = builder.continuation(parent_id);
        }
        chunks.push(builder.build());
        current.clear();
    };

    for sentence in &sentences {
        let sentence_tokens = estimate_tokens(sentence);
        if current_tokens + sentence_tokens > max_tokens && !current.is_empty() {
            flush(&mut current, &mut chunks);
            current_tokens = 0;
        }
        current.push(sentence);
        current_tokens += sentence_tokens;
    }
    flush(&mut current, &mut chunks);

    let total = chunks.len();
    for chunk in &mut chunks {
        chunk.total_in_section = total;
    }
    chunks
}

/// Splits text at sentence boundaries using terminal punctuation followed
/// by whitespace. Not perfect, but deterministic and dependency-free.
#[must_use]
pub fn split_sentences(text: &str) -> Vec<&str> {
    // Lazily-built pattern: terminal punctuation, optional closing quotes
    // or brackets, then whitespace.
    static BOUNDARY: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let boundary = BOUNDARY.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        regex::Regex::new(r#"[.!?]["')\]]*\s+"#).unwrap()
    });

    let mut sentences = Vec::new();
    let mut start = 0usize;
    for found in boundary.find_iter(text) {
        let end = found.end();
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = end;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences_basic() {
        let sentences = split_sentences("First one. Second one! Third?");
        assert_eq!(sentences, vec!["First one.", "Second one!", "Third?"]);
    }

    #[test]
    fn test_split_sentences_no_terminal() {
        let sentences = split_sentences("no punctuation here");
        assert_eq!(sentences, vec!["no punctuation here"]);
    }

    #[test]
    fn test_split_sentences_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_split_sentences_decimals_stay_together() {
        // A decimal point is not followed by whitespace, so it never splits.
        let sentences = split_sentences("Revenue was 15.2M in 2023. Growth continued.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("15.2M"));
    }

    #[test]
    fn test_first_page_bbox_only_first_page() {
        let paragraphs = vec![
            (
                1,
                "a".to_string(),
                vec![0.0, 0.0, 2.0, 0.0, 2.0, 1.0, 0.0, 1.0],
            ),
            (
                1,
                "b".to_string(),
                vec![0.0, 2.0, 4.0, 2.0, 4.0, 3.0, 0.0, 3.0],
            ),
            (
                2,
                "c".to_string(),
                vec![0.0, 0.0, 100.0, 0.0, 100.0, 100.0, 0.0, 100.0],
            ),
        ];
        let bbox = first_page_bbox(&paragraphs).unwrap();
        assert_eq!(bbox.page, 1);
        assert!((bbox.x1 - 4.0).abs() < f64::EPSILON);
        assert!((bbox.y1 - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_page_bbox_no_polygons() {
        let paragraphs = vec![(1, "a".to_string(), Vec::new())];
        assert!(first_page_bbox(&paragraphs).is_none());
    }
}
