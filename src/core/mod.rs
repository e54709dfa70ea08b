//! Core domain types: documents, chunks, collections, sessions, workflows,
//! extractions, job states, and artifact pointers.

mod artifact;
mod chunk;
mod collection;
mod document;
mod extraction;
mod job;
mod session;
mod workflow;

pub use artifact::ArtifactPointer;
pub use chunk::{BoundingBox, ChunkKind, DocChunk, DocChunkBuilder, KeyValuePair, make_chunk_id};
pub use collection::Collection;
pub use document::{Document, DocumentStatus};
pub use extraction::{ExtractionRecord, ExtractionStatus};
pub use job::{JobParent, JobState, JobStatus, STAGE_FLAGS};
pub use session::{ChatMessage, ChatSession, ConversationSummary, MessageRole};
pub use workflow::{
    RunMode, RunStatus, SectionSpec, VariableSpec, VariableType, WorkflowRun, WorkflowTemplate,
};

/// Estimates token count using the ~4 characters per token approximation.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Returns the current Unix timestamp in seconds.
#[allow(clippy::cast_possible_wrap)]
#[must_use]
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Computes the SHA-256 hash of a byte slice as lowercase hex.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
