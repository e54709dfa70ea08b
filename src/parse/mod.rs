//! Parser interface and output model.
//!
//! PDF parsers (Azure Document Intelligence, PyMuPDF, LLMWhisperer) are
//! external collaborators. The core consumes their output through
//! [`ParserOutput`] and never instantiates a parser directly: a
//! [`ParserFactory`] resolves the parser by kind, and missing registrations
//! are configuration errors discovered at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Role of a paragraph as tagged by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParagraphRole {
    /// Opens a new section.
    SectionHeading,
    /// Document title.
    Title,
    /// Body content.
    Content,
    /// Repeated page header.
    PageHeader,
    /// Repeated page footer.
    PageFooter,
}

/// A paragraph with its role and optional bounding polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedParagraph {
    /// Paragraph text.
    pub content: String,
    /// Role tag.
    pub role: ParagraphRole,
    /// 8-point bounding polygon `[x0,y0,...,x3,y3]`, if supplied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub polygon: Vec<f64>,
}

/// A table extracted by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTable {
    /// Rendered table text (row-wise, cell-delimited).
    pub text: String,
    /// Structured cell grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<serde_json::Value>,
    /// Row count.
    pub row_count: usize,
    /// Column count.
    pub column_count: usize,
    /// 8-point bounding polygon, if supplied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub polygon: Vec<f64>,
}

/// A key-value pair extracted by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedKeyValue {
    /// Key text.
    pub key: String,
    /// Value text (may be empty).
    #[serde(default)]
    pub value: String,
    /// 1-based page number.
    pub page_number: u32,
    /// 8-point bounding polygon covering the pair, if supplied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub polygon: Vec<f64>,
}

/// One parsed page: paragraphs grouped by role plus the page's tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedPage {
    /// 1-based page number.
    pub page_number: u32,
    /// Paragraphs on this page keyed by role.
    #[serde(default)]
    pub paragraphs_by_role: BTreeMap<ParagraphRole, Vec<ParsedParagraph>>,
    /// Tables on this page.
    #[serde(default)]
    pub tables: Vec<ParsedTable>,
}

/// Complete parser output for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserOutput {
    /// Full extracted text.
    pub text: String,
    /// Per-page structure.
    pub pages: Vec<ParsedPage>,
    /// Key-value pairs across the document.
    #[serde(default)]
    pub key_value_pairs: Vec<ParsedKeyValue>,
    /// Total pages.
    pub page_count: u32,
    /// Parser cost in USD, if metered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Name of the parser that produced this output.
    pub parser_name: String,
}

/// Parser selection key, resolved by tier and PDF type upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Azure Document Intelligence (layout model).
    Azure,
    /// PyMuPDF text extraction.
    PyMuPdf,
    /// LLMWhisperer OCR.
    LlmWhisperer,
    /// Built-in plain-text reader (tests, CLI ingestion of text files).
    Plain,
}

impl ParserKind {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::PyMuPdf => "pymupdf",
            Self::LlmWhisperer => "llmwhisperer",
            Self::Plain => "plain",
        }
    }
}

/// Trait for document parsers.
pub trait Parser: Send + Sync {
    /// Parser name recorded on documents.
    fn name(&self) -> &'static str;

    /// Parses the file at `path` into structured output.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or yields no content.
    fn parse(&self, path: &Path) -> Result<ParserOutput>;
}

/// Enum-keyed parser registry constructed at startup.
pub struct ParserFactory {
    parsers: std::collections::HashMap<ParserKind, Box<dyn Parser>>,
}

impl std::fmt::Debug for ParserFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserFactory")
            .field("registered", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ParserFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsers: std::collections::HashMap::new(),
        }
    }

    /// Creates a factory with the built-in plain-text parser registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(ParserKind::Plain, Box::new(PlainTextParser::new(500)));
        factory
    }

    /// Registers a parser implementation for a kind.
    pub fn register(&mut self, kind: ParserKind, parser: Box<dyn Parser>) {
        self.parsers.insert(kind, parser);
    }

    /// Resolves the parser for a kind.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no parser is registered for `kind`.
    pub fn resolve(&self, kind: ParserKind) -> Result<&dyn Parser> {
        self.parsers
            .get(&kind)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::Config {
                message: format!("no parser registered for '{}'", kind.as_str()),
            })
    }

    /// Registered parser kinds.
    #[must_use]
    pub fn registered(&self) -> Vec<ParserKind> {
        self.parsers.keys().copied().collect()
    }
}

impl Default for ParserFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Built-in parser for plain-text files.
///
/// Treats Markdown-style `#` headings and SCREAMING-CASE lines as section
/// headings and paginates by character count, which gives tests and CLI
/// ingestion a deterministic structure to chunk.
#[derive(Debug)]
pub struct PlainTextParser {
    /// Characters per synthetic page.
    chars_per_page: usize,
}

impl PlainTextParser {
    /// Creates a plain-text parser with roughly `chars_per_page * 4` chars
    /// per synthetic page (a printed page is ~2000 chars).
    #[must_use]
    pub const fn new(chars_per_page_tokens: usize) -> Self {
        Self {
            chars_per_page: chars_per_page_tokens * 4,
        }
    }

    fn looks_like_heading(line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.len() > 120 {
            return false;
        }
        if trimmed.starts_with('#') {
            return true;
        }
        // SCREAMING-CASE line with at least one letter
        trimmed.chars().any(char::is_alphabetic)
            && trimmed
                .chars()
                .all(|c| c.is_uppercase() || !c.is_alphabetic())
    }
}

impl Parser for PlainTextParser {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn parse(&self, path: &Path) -> Result<ParserOutput> {
        let text = crate::io::read_to_string(path)?;
        if text.trim().is_empty() {
            return Err(Error::Chunking(crate::error::ChunkingError::MissingStructure {
                what: "content (file is empty)".to_string(),
            }));
        }

        let mut pages: Vec<ParsedPage> = Vec::new();
        let mut current = ParsedPage {
            page_number: 1,
            ..ParsedPage::default()
        };
        let mut chars_on_page = 0usize;

        for block in text.split("\n\n") {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            let role = if Self::looks_like_heading(block) {
                ParagraphRole::SectionHeading
            } else {
                ParagraphRole::Content
            };
            let content = block.trim_start_matches('#').trim().to_string();
            chars_on_page += content.len();
            current
                .paragraphs_by_role
                .entry(role)
                .or_default()
                .push(ParsedParagraph {
                    content,
                    role,
                    polygon: Vec::new(),
                });

            if chars_on_page >= self.chars_per_page {
                let page_number = current.page_number;
                pages.push(std::mem::take(&mut current));
                current.page_number = page_number + 1;
                chars_on_page = 0;
            }
        }
        if !current.paragraphs_by_role.is_empty() {
            pages.push(current);
        }

        #[allow(clippy::cast_possible_truncation)]
        let page_count = pages.len() as u32;
        Ok(ParserOutput {
            text,
            pages,
            key_value_pairs: Vec::new(),
            page_count,
            cost_usd: None,
            parser_name: "plain".to_string(),
        })
    }
}

impl ParserOutput {
    /// Loads parser output from a persisted JSON artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or not valid output JSON.
    pub fn from_artifact(path: &Path) -> Result<Self> {
        let text = crate::io::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Storage(crate::error::StorageError::Serialization(e.to_string()))
        })
    }
}
