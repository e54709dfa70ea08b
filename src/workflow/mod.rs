//! Workflow generation engine.
//!
//! Versioned templates drive targeted section-based retrieval, context
//! assembly with citation tokens, schema-enforced generation (direct or
//! map-reduce), citation and domain validation with corrective retries,
//! normalization, and artifact persistence.

pub mod context;
pub mod generate;
pub mod normalize;
pub mod registry;
pub mod template;
pub mod validate;

pub use context::{
    CitationMeta, ContextBuilder, ExecutionMode, PreparedContext, SectionChunks, SelectedChunk,
};
pub use generate::{GenerationOutcome, Generator};
pub use normalize::{coerce_numeric, coerce_percentage_decimal, normalize_output};
pub use registry::{GeneratedPrompt, PromptGenerator, PromptRegistry};
pub use template::{MEMO_REQUIRED_SECTIONS, investment_memo_template, red_flags_template};
pub use validate::{
    ValidationIssue, ValidationReport, adaptive_min_citations, citation_re, extract_citations,
    used_citation_set, validate_citations, validate_memo_constraints,
};
