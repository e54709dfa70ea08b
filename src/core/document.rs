//! Document record: an uploaded file moving through the ingestion pipeline.

use serde::{Deserialize, Serialize};

/// Ingestion status of a document. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// File received, not yet parsed.
    Uploaded,
    /// Parser running.
    Parsing,
    /// Chunker running.
    Chunking,
    /// Embedding chunks.
    Embedding,
    /// Fully ingested and retrievable.
    Completed,
    /// Ingestion failed.
    Failed,
}

impl DocumentStatus {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Parsing => "parsing",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(Self::Uploaded),
            "parsing" => Some(Self::Parsing),
            "chunking" => Some(Self::Chunking),
            "embedding" => Some(Self::Embedding),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document id (UUID v4).
    pub id: String,
    /// Owning user id.
    pub user_id: String,
    /// Owning organization id.
    pub org_id: String,
    /// Original filename.
    pub filename: String,
    /// SHA-256 of the uploaded bytes.
    pub content_hash: String,
    /// Byte size of the upload.
    pub byte_size: u64,
    /// Page count once parsed.
    pub page_count: Option<u32>,
    /// Current ingestion status.
    pub status: DocumentStatus,
    /// Parser used (e.g. "azure", "pymupdf", "llmwhisperer").
    pub parser: Option<String>,
    /// Pointer to the persisted parse artifact.
    pub parse_artifact: Option<super::ArtifactPointer>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl Document {
    /// Creates a new document record in `Uploaded` state.
    #[must_use]
    pub fn new(user_id: &str, org_id: &str, filename: &str, bytes: &[u8]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            filename: filename.to_string(),
            content_hash: super::content_hash(bytes),
            byte_size: bytes.len() as u64,
            page_count: None,
            status: DocumentStatus::Uploaded,
            parser: None,
            parse_artifact: None,
            created_at: super::current_timestamp(),
        }
    }
}
