//! One-shot structured extraction records.

use serde::{Deserialize, Serialize};

/// Status of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Created, not yet started.
    Pending,
    /// Stages executing.
    Processing,
    /// Structured result persisted.
    Completed,
    /// Terminal failure.
    Failed,
}

impl ExtractionStatus {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A one-shot structured extraction over a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// Extraction id (UUID v4).
    pub id: String,
    /// Source document id.
    pub document_id: String,
    /// Content hash of the document, for global deduplication.
    pub content_hash: String,
    /// Owning user id.
    pub user_id: String,
    /// Owning organization id.
    pub org_id: String,
    /// Optional user hint guiding extraction.
    pub context: Option<String>,
    /// Current status.
    pub status: ExtractionStatus,
    /// Pointer to the persisted result artifact.
    pub artifact: Option<super::ArtifactPointer>,
    /// Parser used for the document.
    pub parser: Option<String>,
    /// Total tokens consumed.
    pub token_usage: Option<u64>,
    /// Cost in USD.
    pub cost_usd: Option<f64>,
    /// Result was served from the dedup cache.
    pub from_cache: bool,
    /// Result was served from a prior extraction of the same content.
    pub from_history: bool,
    /// Terminal error message, if failed.
    pub error_message: Option<String>,
    /// Unix timestamp of submission.
    pub created_at: i64,
}

impl ExtractionRecord {
    /// Creates a pending extraction for a document.
    #[must_use]
    pub fn new(
        document_id: &str,
        content_hash: &str,
        user_id: &str,
        org_id: &str,
        context: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            content_hash: content_hash.to_string(),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            context,
            status: ExtractionStatus::Pending,
            artifact: None,
            parser: None,
            token_usage: None,
            cost_usd: None,
            from_cache: false,
            from_history: false,
            error_message: None,
            created_at: super::current_timestamp(),
        }
    }
}
