//! Job state: the progress/stream record for exactly one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StageErrorKind;

/// Stage-completion flag names recognized on a `JobState`.
///
/// Each pipeline marks the subset it uses; the retry path reads them to
/// decide which stages to skip.
pub const STAGE_FLAGS: &[&str] = &[
    "parsing",
    "chunking",
    "embedding",
    "summarizing",
    "extracting",
    "context",
    "artifact",
    "validation",
    "analyze_template",
    "detect_fields",
    "auto_map",
    "fill",
];

/// The parent entity a job tracks. Exactly one per job, enforced by an
/// exclusivity constraint in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum JobParent {
    /// Structured extraction.
    Extraction(String),
    /// Document parse/ingestion.
    Document(String),
    /// Workflow run.
    WorkflowRun(String),
    /// Template-fill run.
    TemplateFillRun(String),
}

impl JobParent {
    /// The parent entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Extraction(id)
            | Self::Document(id)
            | Self::WorkflowRun(id)
            | Self::TemplateFillRun(id) => id,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not yet started.
    Pending,
    /// A stage is executing.
    Processing,
    /// All stages completed.
    Completed,
    /// Terminal failure.
    Failed,
    /// Paused awaiting a user action (template-fill review).
    AwaitingReview,
}

impl JobStatus {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingReview => "awaiting_review",
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
            "awaiting_review" => Some(Self::AwaitingReview),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Progress and streaming record for exactly one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Job id (UUID v4).
    pub id: String,
    /// Parent entity (exactly one).
    pub parent: JobParent,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Name of the currently executing stage.
    pub current_stage: Option<String>,
    /// Progress percentage (0-100).
    pub progress_percent: u8,
    /// Per-stage completion flags (see [`STAGE_FLAGS`]).
    #[serde(default)]
    pub stage_flags: BTreeMap<String, bool>,
    /// Storage keys of intermediate artifacts, keyed by stage name.
    #[serde(default)]
    pub intermediate_artifacts: BTreeMap<String, String>,
    /// Stage where the job failed.
    pub error_stage: Option<String>,
    /// Error message, if failed.
    pub error_message: Option<String>,
    /// Classified error kind, if failed.
    pub error_type: Option<StageErrorKind>,
    /// Whether the recorded error is retryable.
    pub error_retryable: Option<bool>,
    /// Free-text progress message.
    pub message: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of last update.
    pub updated_at: i64,
}

impl JobState {
    /// Creates a pending job for the given parent entity.
    #[must_use]
    pub fn new(parent: JobParent) -> Self {
        let now = super::current_timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent,
            status: JobStatus::Pending,
            current_stage: None,
            progress_percent: 0,
            stage_flags: BTreeMap::new(),
            intermediate_artifacts: BTreeMap::new(),
            error_stage: None,
            error_message: None,
            error_type: None,
            error_retryable: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a stage has been marked complete.
    #[must_use]
    pub fn stage_complete(&self, stage: &str) -> bool {
        self.stage_flags.get(stage).copied().unwrap_or(false)
    }

    /// Clears error fields and resets status to `Processing` for a retry.
    ///
    /// Stage flags and intermediate artifacts are preserved so the chain can
    /// resume from the last completed stage.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Processing;
        self.error_stage = None;
        self.error_message = None;
        self.error_type = None;
        self.error_retryable = None;
        self.message = Some("retrying".to_string());
        self.updated_at = super::current_timestamp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job() {
        let job = JobState::new(JobParent::Extraction("ex-1".to_string()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.parent.id(), "ex-1");
        assert!(!job.stage_complete("parsing"));
    }

    #[test]
    fn test_reset_for_retry_preserves_progress() {
        let mut job = JobState::new(JobParent::WorkflowRun("run-1".to_string()));
        job.stage_flags.insert("summarizing".to_string(), true);
        job.intermediate_artifacts
            .insert("summarizing".to_string(), "artifacts/sum.json".to_string());
        job.status = JobStatus::Failed;
        job.error_stage = Some("extracting".to_string());
        job.error_type = Some(StageErrorKind::LlmError);
        job.error_retryable = Some(true);

        job.reset_for_retry();

        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error_stage.is_none());
        assert!(job.error_type.is_none());
        assert!(job.stage_complete("summarizing"));
        assert_eq!(
            job.intermediate_artifacts.get("summarizing").map(String::as_str),
            Some("artifacts/sum.json")
        );
    }

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::AwaitingReview,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::AwaitingReview.is_terminal());
    }

    #[test]
    fn test_parent_serialization() {
        let parent = JobParent::WorkflowRun("run-9".to_string());
        let json = serde_json::to_string(&parent).unwrap();
        assert!(json.contains("workflow_run"));
        let back: JobParent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parent);
    }
}
