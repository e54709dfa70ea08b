//! # Dossier
//!
//! Document intelligence engine: staged ingestion pipelines, hybrid
//! retrieval, and LLM-backed workflow synthesis and RAG chat over PDF
//! document sets.
//!
//! ## Subsystems
//!
//! - **Pipeline runtime**: a durable, resumable task-chain model driving
//!   extraction, workflow, and template-fill jobs through ordered stages
//!   with progress streaming.
//! - **Hybrid retrieval**: dense + lexical fusion (RRF), cross-encoder
//!   re-ranking, query-adaptive sizing, and context expansion over
//!   structurally linked chunks.
//! - **Workflow engine**: section-scoped context assembly, schema-enforced
//!   generation with prompt caching, citation validation, and map-reduce
//!   execution for large contexts.
//! - **Chat orchestrator**: query understanding, multi-document comparison
//!   with pairing/clustering, conversation memory, and budget enforcement.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
// Note: unsafe is needed for memory-mapped I/O (memmap2)
#![warn(unsafe_code)]

pub mod chat;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod core;
pub mod embedding;
pub mod error;
pub mod io;
pub mod llm;
pub mod parse;
pub mod pipeline;
pub mod retrieval;
pub mod storage;
pub mod workflow;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use core::{
    ArtifactPointer, BoundingBox, ChatMessage, ChatSession, ChunkKind, Collection, DocChunk,
    Document, DocumentStatus, ExtractionRecord, JobParent, JobState, JobStatus, WorkflowRun,
    WorkflowTemplate,
};

// Re-export storage types
pub use storage::{ChunkFilter, ChunkRow, SharedStore, SqliteStore};

// Re-export retrieval types
pub use retrieval::{
    HybridRetriever, QueryType, QueryUnderstanding, Reranker, RetrievedChunk, RrfConfig,
    reciprocal_rank_fusion,
};

// Re-export embedding types
#[cfg(feature = "fastembed-embeddings")]
pub use embedding::FastEmbedEmbedder;
pub use embedding::{
    DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder, cosine_similarity, create_embedder,
};

// Re-export LLM types
pub use llm::{LlmClient, LlmProvider, TokenUsage};

// Re-export pipeline types
pub use pipeline::{PipelineEngine, ProgressBus, ProgressEvent, TemplateFillOps};

// Re-export chat types
pub use chat::{ChatEvent, ChatOptions, ChatOrchestrator};

// Re-export workflow types
pub use workflow::{PromptRegistry, investment_memo_template, red_flags_template};

// Re-export CLI types
pub use cli::{Cli, Commands, OutputFormat};
