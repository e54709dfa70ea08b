//! Progress event streaming.
//!
//! Each job has an event channel on the [`ProgressBus`]. Subscribers get
//! the current snapshot immediately (streams are idempotent and may be
//! re-opened), then live events in order: `progress` events, then
//! `complete` or `error`, then always `end`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{JobState, JobStatus};
use crate::error::StageErrorKind;

/// Capacity of each job's broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// A progress event for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ProgressEvent {
    /// Stage progress update.
    Progress {
        /// Job id.
        job_id: String,
        /// Job status string.
        status: String,
        /// Current stage name.
        stage: Option<String>,
        /// Progress percent (0-100).
        percent: u8,
        /// Free-text message.
        message: Option<String>,
    },
    /// Job finished successfully.
    Complete {
        /// Job id.
        job_id: String,
    },
    /// Job failed.
    Error {
        /// Job id.
        job_id: String,
        /// Stage that failed.
        stage: Option<String>,
        /// Error message.
        message: String,
        /// Classified error kind.
        error_type: StageErrorKind,
        /// Whether the failure is retryable.
        retryable: bool,
    },
    /// Comparison flow needs a client-side document selection.
    ComparisonSelection {
        /// Job id.
        job_id: String,
        /// Selection payload.
        payload: serde_json::Value,
    },
    /// Terminal marker; always follows `complete` or `error`.
    End {
        /// Job id.
        job_id: String,
    },
}

impl ProgressEvent {
    /// The job this event belongs to.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Progress { job_id, .. }
            | Self::Complete { job_id }
            | Self::Error { job_id, .. }
            | Self::ComparisonSelection { job_id, .. }
            | Self::End { job_id } => job_id,
        }
    }

    /// Whether this is a terminal event (`complete` or `error`).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Formats the event as Server-Sent-Event lines.
    #[must_use]
    pub fn to_sse(&self) -> String {
        let event_name = match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::ComparisonSelection { .. } => "comparison_selection",
            Self::End { .. } => "end",
        };
        format!(
            "event: {event_name}\ndata: {}\n\n",
            serde_json::to_string(self).unwrap_or_default()
        )
    }

    /// Builds the snapshot event for a job's current state.
    #[must_use]
    pub fn snapshot(job: &JobState) -> Self {
        match job.status {
            JobStatus::Completed => Self::Complete {
                job_id: job.id.clone(),
            },
            JobStatus::Failed => Self::Error {
                job_id: job.id.clone(),
                stage: job.error_stage.clone(),
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "failed".to_string()),
                error_type: job.error_type.unwrap_or(StageErrorKind::StorageError),
                retryable: job.error_retryable.unwrap_or(false),
            },
            JobStatus::Pending | JobStatus::Processing | JobStatus::AwaitingReview => {
                Self::Progress {
                    job_id: job.id.clone(),
                    status: job.status.as_str().to_string(),
                    stage: job.current_stage.clone(),
                    percent: job.progress_percent,
                    message: job.message.clone(),
                }
            }
        }
    }
}

/// Per-job broadcast channels for progress events.
#[derive(Debug, Default)]
pub struct ProgressBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to the job's channel. Terminal events are
    /// automatically followed by `end`, after which the channel is
    /// dropped (late subscribers replay from the snapshot instead).
    pub fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id().to_string();
        let terminal = event.is_terminal();

        let sender = {
            let mut channels = match self.channels.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            channels
                .entry(job_id.clone())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };

        let _ = sender.send(event);
        if terminal {
            let _ = sender.send(ProgressEvent::End { job_id: job_id.clone() });
            if let Ok(mut channels) = self.channels.lock() {
                channels.remove(&job_id);
            }
        }
    }

    /// Subscribes to a job's live events. Callers replay the snapshot
    /// (from [`ProgressEvent::snapshot`]) before consuming the receiver.
    #[must_use]
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
