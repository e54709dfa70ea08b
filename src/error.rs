//! Error types for document intelligence operations.
//!
//! This module provides a comprehensive error hierarchy using `thiserror` for
//! all engine operations including storage, chunking, retrieval, LLM calls,
//! workflow generation, chat, and pipeline execution.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage-related errors (database operations).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chunking-related errors (parser output processing).
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// Retrieval-related errors (search, re-ranking, expansion).
    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// LLM provider errors (API failures, timeouts, parse errors).
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// Workflow generation errors.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Chat orchestration errors.
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),

    /// Pipeline execution errors.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// I/O errors (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid state errors.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the invalid state.
        message: String,
    },

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Storage-specific errors for database operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// Storage not initialized (init command not run).
    #[error("engine not initialized. Run: dossier init")]
    NotInitialized,

    /// Document not found by ID.
    #[error("document not found: {id}")]
    DocumentNotFound {
        /// Document ID that was not found.
        id: String,
    },

    /// Chunk not found by ID.
    #[error("chunk not found: {id}")]
    ChunkNotFound {
        /// Chunk ID that was not found.
        id: String,
    },

    /// Chat session not found.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// Session ID that was not found.
        id: String,
    },

    /// Workflow template not found.
    #[error("workflow not found: {id}")]
    WorkflowNotFound {
        /// Workflow template ID that was not found.
        id: String,
    },

    /// Workflow run not found.
    #[error("workflow run not found: {id}")]
    RunNotFound {
        /// Run ID that was not found.
        id: String,
    },

    /// Extraction record not found.
    #[error("extraction not found: {id}")]
    ExtractionNotFound {
        /// Extraction ID that was not found.
        id: String,
    },

    /// Job state not found.
    #[error("job not found: {id}")]
    JobNotFound {
        /// Job ID that was not found.
        id: String,
    },

    /// Duplicate document (same org and content hash).
    #[error("duplicate document: content hash {hash} already ingested")]
    DuplicateDocument {
        /// SHA-256 content hash of the duplicate upload.
        hash: String,
    },

    /// Concurrent-job guard rejected a submission.
    #[error("user {user_id} already has an active extraction")]
    ExtractionInFlight {
        /// User with an active extraction.
        user_id: String,
    },

    /// Artifact store failure.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Chunking-specific errors for parser output processing.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Parser output is missing required structure.
    #[error("parser output missing {what}")]
    MissingStructure {
        /// Which part of the parser output is absent.
        what: String,
    },

    /// Invalid chunk configuration.
    #[error("invalid chunk configuration: {reason}")]
    InvalidConfig {
        /// Reason the configuration is invalid.
        reason: String,
    },

    /// Regex compilation error.
    #[error("regex error: {0}")]
    Regex(String),

    /// Document produced no chunks at all.
    #[error("no chunks produced for document {document_id}")]
    EmptyOutput {
        /// Document that yielded no chunks.
        document_id: String,
    },
}

/// Retrieval-specific errors.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Embedding generation failed.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// No chunks matched across all sections of a workflow run.
    #[error("no chunks retrieved: documents may not be indexed")]
    NoChunksRetrieved,

    /// Cross-encoder scoring failed.
    #[error("re-ranking failed: {0}")]
    Rerank(String),

    /// Full-text query could not be executed.
    #[error("lexical search failed: {0}")]
    Lexical(String),
}

/// LLM provider and client errors.
#[derive(Error, Debug)]
pub enum LlmError {
    /// API key missing from config and environment.
    #[error("API key not found. Set OPENAI_API_KEY or DOSSIER_API_KEY")]
    ApiKeyMissing,

    /// API request failed.
    #[error("API request failed: {message}")]
    ApiRequest {
        /// Error description from the provider.
        message: String,
        /// HTTP status code if available.
        status: Option<u16>,
    },

    /// Rate limit or overload (retryable).
    #[error("provider overloaded (status {status}): {message}")]
    Overloaded {
        /// HTTP status code (429 or 5xx).
        status: u16,
        /// Error description from the provider.
        message: String,
    },

    /// Request timed out.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// Streaming failure mid-response.
    #[error("stream error: {message}")]
    Stream {
        /// Error description.
        message: String,
    },

    /// Response could not be parsed as JSON after repair.
    #[error("failed to parse response as JSON: {message}")]
    ResponseParse {
        /// Parse error description.
        message: String,
    },

    /// Schema-enforced output did not conform (provider-boundary violation).
    #[error("schema violation in structured output: {message}")]
    SchemaViolation {
        /// Validation error description.
        message: String,
    },

    /// Unknown provider name in configuration.
    #[error("unsupported provider: {name}")]
    UnsupportedProvider {
        /// Provider name that was not recognized.
        name: String,
    },

    /// Retry attempts exhausted.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        last_error: String,
    },
}

/// Workflow engine errors.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Template has no registered prompt generator.
    #[error("workflow '{name}' has no registered prompt generator")]
    MissingPromptGenerator {
        /// Workflow template name.
        name: String,
    },

    /// Prompt generator failed.
    #[error("prompt generation failed for '{name}': {message}")]
    PromptGeneration {
        /// Workflow template name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// Template rendering failed (missing variable, malformed template).
    #[error("template error: {message}")]
    Template {
        /// Failure description.
        message: String,
    },

    /// Generated output failed validation after all attempts.
    #[error("validation failed after {attempts} attempts: {reason}")]
    ValidationFailed {
        /// Attempts made.
        attempts: u32,
        /// Last validation failure.
        reason: String,
    },

    /// Document count outside the template's allowed range.
    #[error("document count {got} outside allowed range {min}..={max}")]
    DocumentCount {
        /// Documents supplied.
        got: usize,
        /// Minimum allowed.
        min: usize,
        /// Maximum allowed.
        max: usize,
    },
}

/// Chat orchestration errors.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Empty user message.
    #[error("User message cannot be empty")]
    EmptyMessage,

    /// Comparison requested with too few documents.
    #[error("comparison requires at least 2 documents, got {got}")]
    TooFewDocuments {
        /// Documents available.
        got: usize,
    },
}

/// Pipeline runtime errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage failed with a classified error.
    #[error("stage '{stage}' failed ({kind}): {message}")]
    StageFailed {
        /// Stage name.
        stage: String,
        /// Classified error kind.
        kind: StageErrorKind,
        /// Failure description.
        message: String,
    },

    /// Broker is shut down and cannot accept work.
    #[error("task broker is not running")]
    BrokerStopped,

    /// Job cannot be retried from its current state.
    #[error("job {job_id} is not retryable: {reason}")]
    NotRetryable {
        /// Job identifier.
        job_id: String,
        /// Why the retry was refused.
        reason: String,
    },
}

/// I/O-specific errors for file operations.
#[derive(Error, Debug)]
pub enum IoError {
    /// File not found.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found.
        path: String,
    },

    /// Failed to read file.
    #[error("failed to read file: {path}: {reason}")]
    ReadFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to write file.
    #[error("failed to write file: {path}: {reason}")]
    WriteFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Memory mapping error.
    #[error("memory mapping failed: {path}: {reason}")]
    MmapFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Generic I/O error wrapper.
    #[error("I/O error: {0}")]
    Generic(String),
}

/// Classified stage error kinds, used in logs, `JobState` records, and
/// progress events. Matches the user-visible error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// File unreadable, parser returned empty, OCR failed.
    ParseError,
    /// No chunks found for the specified documents.
    RetrievalError,
    /// Provider 429/5xx, timeout, stream interruption.
    LlmError,
    /// Citation whitelist or schema violation.
    ValidationError,
    /// Hard schema violation at the provider boundary.
    SchemaError,
    /// Prompt template rendering failed.
    TemplateError,
    /// Registered prompt generator threw.
    PromptGenerationError,
    /// Template lacks a registered prompt generator.
    ConfigurationError,
    /// Artifact store unavailable.
    StorageError,
}

impl StageErrorKind {
    /// Whether this error kind is retryable by the pipeline runtime.
    ///
    /// Retryable errors bump the attempts counter and are re-enqueued with
    /// exponential backoff. Non-retryable errors mark the job failed.
    #[must_use]
    pub const fn retryable(self) -> bool {
        match self {
            Self::LlmError | Self::ValidationError | Self::StorageError => true,
            Self::ParseError
            | Self::RetrievalError
            | Self::SchemaError
            | Self::TemplateError
            | Self::PromptGenerationError
            | Self::ConfigurationError => false,
        }
    }

    /// Stable string form used in persisted records and event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::RetrievalError => "retrieval_error",
            Self::LlmError => "llm_error",
            Self::ValidationError => "validation_error",
            Self::SchemaError => "schema_error",
            Self::TemplateError => "template_error",
            Self::PromptGenerationError => "prompt_generation_error",
            Self::ConfigurationError => "configuration_error",
            Self::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classifies this error into the pipeline stage-error taxonomy.
    #[must_use]
    pub const fn stage_kind(&self) -> StageErrorKind {
        match self {
            Self::Storage(_) | Self::Io(_) => StageErrorKind::StorageError,
            Self::Chunking(_) => StageErrorKind::ParseError,
            Self::Retrieval(_) => StageErrorKind::RetrievalError,
            Self::Llm(LlmError::SchemaViolation { .. }) => StageErrorKind::SchemaError,
            Self::Llm(_) => StageErrorKind::LlmError,
            Self::Workflow(w) => match w {
                WorkflowError::PromptGeneration { .. } => StageErrorKind::PromptGenerationError,
                WorkflowError::Template { .. } => StageErrorKind::TemplateError,
                WorkflowError::ValidationFailed { .. } => StageErrorKind::ValidationError,
                WorkflowError::MissingPromptGenerator { .. }
                | WorkflowError::DocumentCount { .. } => StageErrorKind::ConfigurationError,
            },
            Self::Chat(_) | Self::InvalidState { .. } | Self::Config { .. } => {
                StageErrorKind::ConfigurationError
            }
            Self::Pipeline(PipelineError::StageFailed { kind, .. }) => *kind,
            Self::Pipeline(_) => StageErrorKind::ConfigurationError,
        }
    }
}

// Implement From traits for standard library errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(IoError::Generic(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<regex::Error> for ChunkingError {
    fn from(err: regex::Error) -> Self {
        Self::Regex(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseParse {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidState {
            message: "test error".to_string(),
        };
        assert_eq!(err.to_string(), "invalid state: test error");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotInitialized;
        assert_eq!(err.to_string(), "engine not initialized. Run: dossier init");

        let err = StorageError::ChunkNotFound {
            id: "sec_1_2_para".to_string(),
        };
        assert_eq!(err.to_string(), "chunk not found: sec_1_2_para");
    }

    #[test]
    fn test_chat_empty_message_text() {
        // The exact string is part of the user-visible contract.
        assert_eq!(
            ChatError::EmptyMessage.to_string(),
            "User message cannot be empty"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StageErrorKind::LlmError.retryable());
        assert!(StageErrorKind::ValidationError.retryable());
        assert!(StageErrorKind::StorageError.retryable());
        assert!(!StageErrorKind::ParseError.retryable());
        assert!(!StageErrorKind::RetrievalError.retryable());
        assert!(!StageErrorKind::SchemaError.retryable());
        assert!(!StageErrorKind::TemplateError.retryable());
        assert!(!StageErrorKind::PromptGenerationError.retryable());
        assert!(!StageErrorKind::ConfigurationError.retryable());
    }

    #[test]
    fn test_stage_kind_classification() {
        let err: Error = RetrievalError::NoChunksRetrieved.into();
        assert_eq!(err.stage_kind(), StageErrorKind::RetrievalError);

        let err: Error = LlmError::Overloaded {
            status: 529,
            message: "overloaded".to_string(),
        }
        .into();
        assert_eq!(err.stage_kind(), StageErrorKind::LlmError);

        let err: Error = LlmError::SchemaViolation {
            message: "missing field".to_string(),
        }
        .into();
        assert_eq!(err.stage_kind(), StageErrorKind::SchemaError);

        let err: Error = WorkflowError::MissingPromptGenerator {
            name: "Investment Memo".to_string(),
        }
        .into();
        assert_eq!(err.stage_kind(), StageErrorKind::ConfigurationError);
    }

    #[test]
    fn test_stage_kind_serialization() {
        let json = serde_json::to_string(&StageErrorKind::ValidationError).unwrap_or_default();
        assert_eq!(json, "\"validation_error\"");
        assert_eq!(StageErrorKind::ParseError.as_str(), "parse_error");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: Error = rusqlite_err.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn test_llm_error_variants() {
        let err = LlmError::Timeout { seconds: 120 };
        assert!(err.to_string().contains("120"));

        let err = LlmError::RetriesExhausted {
            attempts: 3,
            last_error: "overloaded".to_string(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_pipeline_stage_failed_display() {
        let err = PipelineError::StageFailed {
            stage: "extract_structured".to_string(),
            kind: StageErrorKind::LlmError,
            message: "timeout".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("extract_structured"));
        assert!(text.contains("llm_error"));
    }

    #[test]
    fn test_workflow_error_variants() {
        let err = WorkflowError::DocumentCount {
            got: 5,
            min: 1,
            max: 3,
        };
        assert!(err.to_string().contains('5'));

        let err = WorkflowError::ValidationFailed {
            attempts: 3,
            reason: "invalid citations".to_string(),
        };
        assert!(err.to_string().contains("invalid citations"));
    }
}
