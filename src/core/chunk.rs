//! Chunk representation for parsed documents.
//!
//! Chunks are the atomic retrieval units produced by the section chunker.
//! Each chunk carries its structural position (section, sequence, page range),
//! cross-chunk links (continuations, siblings, narrative↔table), and a
//! bounding box for PDF highlight rendering.

use serde::{Deserialize, Serialize};

/// Kind of content a chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Human prose grouped under a section heading.
    Narrative,
    /// A structured table, stored separately from narrative.
    Table,
    /// Packed key-value pairs from the parser.
    KeyValue,
}

impl ChunkKind {
    /// Short suffix used in structured chunk ids.
    #[must_use]
    pub const fn id_suffix(self) -> &'static str {
        match self {
            Self::Narrative => "para",
            Self::Table => "table",
            Self::KeyValue => "kv",
        }
    }
}

/// Axis-aligned bounding box on a PDF page, in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// 1-based physical page number.
    pub page: u32,
    /// Left edge.
    pub x0: f64,
    /// Top edge.
    pub y0: f64,
    /// Right edge.
    pub x1: f64,
    /// Bottom edge.
    pub y1: f64,
}

impl BoundingBox {
    /// Builds an axis-aligned box from an 8-point polygon
    /// `[x0,y0, x1,y1, x2,y2, x3,y3]` by taking coordinate extremes.
    ///
    /// Returns `None` when the polygon has fewer than 8 values.
    #[must_use]
    pub fn from_polygon(page: u32, polygon: &[f64]) -> Option<Self> {
        if polygon.len() < 8 {
            return None;
        }
        let xs: Vec<f64> = polygon.iter().step_by(2).copied().collect();
        let ys: Vec<f64> = polygon.iter().skip(1).step_by(2).copied().collect();
        let x0 = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let x1 = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let y0 = ys.iter().copied().fold(f64::INFINITY, f64::min);
        let y1 = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { page, x0, y0, x1, y1 })
    }

    /// Merges two boxes on the same page into their union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            page: self.page,
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// A single key-value pair extracted by the parser, with its own bounding
/// box so the UI can highlight the exact pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValuePair {
    /// Extracted key text.
    pub key: String,
    /// Extracted value text (may be empty).
    pub value: String,
    /// 1-based page the pair appears on.
    pub page_number: u32,
    /// Bounding box covering the pair, if the parser supplied polygons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// A retrieval unit derived from a parsed document.
///
/// Chunks are immutable once written; rewrites require re-ingestion.
///
/// # Invariants
///
/// - `chunk_id` is unique per document and structured as
///   `{section}_{seq}_{kind}`.
/// - If `is_continuation` is set, `parent_chunk_id` refers to a chunk in the
///   same section.
/// - Table chunks and their source-section narrative chunks link
///   bidirectionally (`linked_narrative_id` / `linked_table_ids`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    /// Globally unique structured id: `{section}_{seq}_{kind}`.
    pub chunk_id: String,

    /// Owning document id.
    pub document_id: String,

    /// Sequential index within the document (0-based).
    pub chunk_index: usize,

    /// Full chunk text as indexed for retrieval.
    pub text: String,

    /// Narrative prose (empty for table and key-value chunks).
    pub narrative_text: String,

    /// Structured table payload (table chunks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<serde_json::Value>,

    /// 1-based page the chunk starts on.
    pub page_number: u32,

    /// Inclusive page range `[start, end]`.
    pub page_range: (u32, u32),

    /// Section identifier (`sec_0`, `sec_1`, ...).
    pub section_id: String,

    /// Section heading text, if the section has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_heading: Option<String>,

    /// Ordered ancestor headings, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading_hierarchy: Vec<String>,

    /// Content kind.
    pub kind: ChunkKind,

    /// Whether this chunk continues a split section.
    #[serde(default)]
    pub is_continuation: bool,

    /// Predecessor chunk in the same section (continuations only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<String>,

    /// 1-based position within the section.
    pub sequence: usize,

    /// Total chunks produced for this section.
    pub total_in_section: usize,

    /// All chunk ids sharing this chunk's section.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sibling_chunk_ids: Vec<String>,

    /// Nearest preceding narrative chunk (table chunks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_narrative_id: Option<String>,

    /// Table chunks produced from this chunk's section (narrative only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_table_ids: Vec<String>,

    /// First-paragraph context for tables (first 200 chars).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_context: Option<String>,

    /// Table row count, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,

    /// Table column count, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<usize>,

    /// Key-value pairs with per-pair bounding boxes (key-value chunks only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_value_pairs: Vec<KeyValuePair>,

    /// Estimated token count of `text`.
    pub token_count: usize,

    /// Bounding box for highlight rendering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// Builds a structured chunk id: `{section}_{seq}_{kind}`.
#[must_use]
pub fn make_chunk_id(section_id: &str, sequence: usize, kind: ChunkKind) -> String {
    format!("{section_id}_{sequence}_{}", kind.id_suffix())
}

impl DocChunk {
    /// Short 8-character reference used in chat citation contexts.
    #[must_use]
    pub fn short_ref(&self) -> &str {
        let end = self.chunk_id.len().min(8);
        &self.chunk_id[..end]
    }

    /// First sentence of the chunk text, used as a citation snippet.
    #[must_use]
    pub fn first_sentence(&self) -> &str {
        let text = self.text.trim();
        text.find(['.', '!', '?'])
            .map_or(text, |pos| &text[..=pos.min(text.len() - 1)])
    }

    /// Whether the chunk is a table.
    #[must_use]
    pub const fn is_table(&self) -> bool {
        matches!(self.kind, ChunkKind::Table)
    }

    /// The page to cite for this chunk: the bbox page when present (physical
    /// PDF page), otherwise the logical page number.
    #[must_use]
    pub fn citation_page(&self) -> u32 {
        self.bbox.map_or(self.page_number, |b| b.page)
    }
}

/// Builder for creating chunks with a fluent API.
#[derive(Debug)]
pub struct DocChunkBuilder {
    chunk: DocChunk,
}

impl DocChunkBuilder {
    /// Starts a builder for a chunk of the given kind.
    #[must_use]
    pub fn new(document_id: &str, section_id: &str, sequence: usize, kind: ChunkKind) -> Self {
        Self {
            chunk: DocChunk {
                chunk_id: make_chunk_id(section_id, sequence, kind),
                document_id: document_id.to_string(),
                chunk_index: 0,
                text: String::new(),
                narrative_text: String::new(),
                table: None,
                page_number: 1,
                page_range: (1, 1),
                section_id: section_id.to_string(),
                section_heading: None,
                heading_hierarchy: Vec::new(),
                kind,
                is_continuation: false,
                parent_chunk_id: None,
                sequence,
                total_in_section: 1,
                sibling_chunk_ids: Vec::new(),
                linked_narrative_id: None,
                linked_table_ids: Vec::new(),
                table_context: None,
                row_count: None,
                column_count: None,
                key_value_pairs: Vec::new(),
                token_count: 0,
                bbox: None,
            },
        }
    }

    /// Sets the chunk text (and token count).
    #[must_use]
    pub fn text(mut self, text: String) -> Self {
        self.chunk.token_count = super::estimate_tokens(&text);
        self.chunk.text = text;
        self
    }

    /// Sets the narrative text.
    #[must_use]
    pub fn narrative_text(mut self, text: String) -> Self {
        self.chunk.narrative_text = text;
        self
    }

    /// Sets the structured table payload.
    #[must_use]
    pub fn table(mut self, table: serde_json::Value) -> Self {
        self.chunk.table = Some(table);
        self
    }

    /// Sets the page range (and the starting page number).
    #[must_use]
    pub const fn page_range(mut self, start: u32, end: u32) -> Self {
        self.chunk.page_number = start;
        self.chunk.page_range = (start, end);
        self
    }

    /// Sets the section heading and seeds the heading hierarchy.
    #[must_use]
    pub fn section_heading(mut self, heading: Option<String>) -> Self {
        if let Some(ref h) = heading {
            self.chunk.heading_hierarchy = vec![h.clone()];
        }
        self.chunk.section_heading = heading;
        self
    }

    /// Marks this chunk as a continuation of `parent_chunk_id`.
    #[must_use]
    pub fn continuation(mut self, parent_chunk_id: String) -> Self {
        self.chunk.is_continuation = true;
        self.chunk.parent_chunk_id = Some(parent_chunk_id);
        self
    }

    /// Sets the total chunk count for the section.
    #[must_use]
    pub const fn total_in_section(mut self, total: usize) -> Self {
        self.chunk.total_in_section = total;
        self
    }

    /// Links a table chunk to its preceding narrative chunk.
    #[must_use]
    pub fn linked_narrative(mut self, narrative_id: String) -> Self {
        self.chunk.linked_narrative_id = Some(narrative_id);
        self
    }

    /// Sets table context and dimensions.
    #[must_use]
    pub fn table_metadata(
        mut self,
        context: Option<String>,
        row_count: Option<usize>,
        column_count: Option<usize>,
    ) -> Self {
        self.chunk.table_context = context;
        self.chunk.row_count = row_count;
        self.chunk.column_count = column_count;
        self
    }

    /// Sets the packed key-value pairs.
    #[must_use]
    pub fn key_value_pairs(mut self, pairs: Vec<KeyValuePair>) -> Self {
        self.chunk.key_value_pairs = pairs;
        self
    }

    /// Sets the bounding box.
    #[must_use]
    pub const fn bbox(mut self, bbox: Option<BoundingBox>) -> Self {
        self.chunk.bbox = bbox;
        self
    }

    /// Finalizes the chunk.
    #[must_use]
    pub fn build(self) -> DocChunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrative(section: &str, seq: usize) -> DocChunk {
        DocChunkBuilder::new("doc-1", section, seq, ChunkKind::Narrative)
            .text("Revenue grew 25% year over year. Margins expanded.".to_string())
            .page_range(3, 4)
            .section_heading(Some("Financial Performance".to_string()))
            .build()
    }

    #[test]
    fn test_make_chunk_id() {
        assert_eq!(make_chunk_id("sec_1", 2, ChunkKind::Narrative), "sec_1_2_para");
        assert_eq!(make_chunk_id("page_5", 1, ChunkKind::Table), "page_5_1_table");
        assert_eq!(make_chunk_id("kv_chunk", 0, ChunkKind::KeyValue), "kv_chunk_0_kv");
    }

    #[test]
    fn test_builder_basics() {
        let chunk = narrative("sec_1", 1);
        assert_eq!(chunk.chunk_id, "sec_1_1_para");
        assert_eq!(chunk.page_number, 3);
        assert_eq!(chunk.page_range, (3, 4));
        assert_eq!(chunk.heading_hierarchy, vec!["Financial Performance"]);
        assert!(chunk.token_count > 0);
        assert!(!chunk.is_continuation);
    }

    #[test]
    fn test_continuation_link() {
        let first = narrative("sec_2", 1);
        let second = DocChunkBuilder::new("doc-1", "sec_2", 2, ChunkKind::Narrative)
            .text("More detail.".to_string())
            .continuation(first.chunk_id.clone())
            .build();
        assert!(second.is_continuation);
        assert_eq!(second.parent_chunk_id.as_deref(), Some("sec_2_1_para"));
        assert_eq!(second.section_id, first.section_id);
    }

    #[test]
    fn test_short_ref() {
        let chunk = narrative("sec_1", 1);
        assert_eq!(chunk.short_ref(), "sec_1_1_");
        assert_eq!(chunk.short_ref().len(), 8);
    }

    #[test]
    fn test_first_sentence() {
        let chunk = narrative("sec_1", 1);
        assert_eq!(
            chunk.first_sentence(),
            "Revenue grew 25% year over year."
        );
    }

    #[test]
    fn test_citation_page_prefers_bbox() {
        let mut chunk = narrative("sec_1", 1);
        assert_eq!(chunk.citation_page(), 3);
        chunk.bbox = Some(BoundingBox {
            page: 5,
            x0: 0.0,
            y0: 0.0,
            x1: 1.0,
            y1: 1.0,
        });
        assert_eq!(chunk.citation_page(), 5);
    }

    #[test]
    fn test_bbox_from_polygon() {
        // Clockwise polygon with mixed extremes
        let polygon = [1.0, 2.0, 5.0, 2.0, 5.0, 8.0, 1.0, 8.0];
        let bbox = BoundingBox::from_polygon(3, &polygon).unwrap();
        assert_eq!(bbox.page, 3);
        assert!((bbox.x0 - 1.0).abs() < f64::EPSILON);
        assert!((bbox.y0 - 2.0).abs() < f64::EPSILON);
        assert!((bbox.x1 - 5.0).abs() < f64::EPSILON);
        assert!((bbox.y1 - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bbox_from_short_polygon() {
        assert!(BoundingBox::from_polygon(1, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_bbox_union() {
        let a = BoundingBox { page: 1, x0: 0.0, y0: 0.0, x1: 2.0, y1: 2.0 };
        let b = BoundingBox { page: 1, x0: 1.0, y0: 1.0, x1: 4.0, y1: 3.0 };
        let merged = a.union(&b);
        assert!((merged.x1 - 4.0).abs() < f64::EPSILON);
        assert!((merged.y1 - 3.0).abs() < f64::EPSILON);
        assert!(merged.x0.abs() < f64::EPSILON);
    }

    #[test]
    fn test_chunk_serialization_roundtrip() {
        let chunk = narrative("sec_1", 1);
        let json = serde_json::to_string(&chunk).unwrap();
        let back: DocChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
        // Optional empties are omitted from the wire form
        assert!(!json.contains("linked_table_ids"));
        assert!(!json.contains("key_value_pairs"));
    }

    #[test]
    fn test_table_chunk_links() {
        let chunk = DocChunkBuilder::new("doc-1", "page_2", 1, ChunkKind::Table)
            .text("[Table 1]\nYear | Revenue".to_string())
            .table(serde_json::json!({"rows": [["Year", "Revenue"]]}))
            .table_metadata(Some("Preceding context".to_string()), Some(4), Some(2))
            .linked_narrative("sec_1_1_para".to_string())
            .build();
        assert!(chunk.is_table());
        assert_eq!(chunk.linked_narrative_id.as_deref(), Some("sec_1_1_para"));
        assert_eq!(chunk.row_count, Some(4));
        assert_eq!(chunk.column_count, Some(2));
    }
}
