//! Job tracker: persists `JobState` mutations and emits progress events.
//!
//! `JobState` mutations are single-writer (the task worker that owns the
//! current stage); the streaming endpoint only reads.

use std::sync::Arc;

use super::events::{ProgressBus, ProgressEvent};
use crate::core::{JobState, JobStatus, current_timestamp};
use crate::error::{Result, StageErrorKind};
use crate::storage::{SharedStore, with_store};

/// Tracker for one job.
pub struct JobTracker {
    store: SharedStore,
    bus: Arc<ProgressBus>,
    job_id: String,
}

impl JobTracker {
    /// Creates a tracker for a job.
    #[must_use]
    pub fn new(store: SharedStore, bus: Arc<ProgressBus>, job_id: &str) -> Self {
        Self {
            store,
            bus,
            job_id: job_id.to_string(),
        }
    }

    /// The tracked job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn mutate(&self, f: impl FnOnce(&mut JobState)) -> Result<JobState> {
        with_store(&self.store, |s| {
            let mut job = s
                .get_job(&self.job_id)?
                .ok_or_else(|| crate::error::StorageError::JobNotFound {
                    id: self.job_id.clone(),
                })?;
            f(&mut job);
            job.updated_at = current_timestamp();
            s.update_job(&job)?;
            Ok(job)
        })
    }

    /// Records stage progress, marks completed stage flags, stores
    /// intermediate artifact keys, and emits a `progress` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is missing or the write fails.
    pub fn update_progress(
        &self,
        stage: &str,
        percent: u8,
        message: &str,
        completed_flags: &[&str],
        intermediate: Option<(&str, &str)>,
    ) -> Result<()> {
        let job = self.mutate(|job| {
            job.status = JobStatus::Processing;
            job.current_stage = Some(stage.to_string());
            job.progress_percent = percent.min(100);
            job.message = Some(message.to_string());
            for flag in completed_flags {
                job.stage_flags.insert((*flag).to_string(), true);
            }
            if let Some((key, value)) = intermediate {
                job.intermediate_artifacts
                    .insert(key.to_string(), value.to_string());
            }
        })?;

        self.bus.publish(ProgressEvent::snapshot(&job));
        Ok(())
    }

    /// Marks the job awaiting user review (template-fill pause point).
    ///
    /// # Errors
    ///
    /// Returns an error if the job is missing or the write fails.
    pub fn mark_awaiting_review(&self, message: &str) -> Result<()> {
        let job = self.mutate(|job| {
            job.status = JobStatus::AwaitingReview;
            job.message = Some(message.to_string());
        })?;
        self.bus.publish(ProgressEvent::snapshot(&job));
        Ok(())
    }

    /// Marks the job completed and emits `complete` (followed by `end`).
    ///
    /// # Errors
    ///
    /// Returns an error if the job is missing or the write fails.
    pub fn mark_completed(&self) -> Result<()> {
        self.mutate(|job| {
            job.status = JobStatus::Completed;
            job.progress_percent = 100;
            job.current_stage = None;
        })?;
        self.bus.publish(ProgressEvent::Complete {
            job_id: self.job_id.clone(),
        });
        Ok(())
    }

    /// Records a stage failure on the job and emits `error` (followed by
    /// `end`).
    ///
    /// # Errors
    ///
    /// Returns an error if the job is missing or the write fails.
    pub fn mark_error(
        &self,
        stage: &str,
        message: &str,
        kind: StageErrorKind,
    ) -> Result<()> {
        self.mutate(|job| {
            job.status = JobStatus::Failed;
            job.error_stage = Some(stage.to_string());
            job.error_message = Some(message.to_string());
            job.error_type = Some(kind);
            job.error_retryable = Some(kind.retryable());
        })?;
        self.bus.publish(ProgressEvent::Error {
            job_id: self.job_id.clone(),
            stage: Some(stage.to_string()),
            message: message.to_string(),
            error_type: kind,
            retryable: kind.retryable(),
        });
        Ok(())
    }

    /// Emits a `comparison_selection`-style event keyed by this job.
    pub fn emit_selection(&self, payload: serde_json::Value) {
        self.bus.publish(ProgressEvent::ComparisonSelection {
            job_id: self.job_id.clone(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobParent;
    use crate::storage::{SqliteStore, shared};

    fn setup() -> (SharedStore, Arc<ProgressBus>, JobState) {
        let mut store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        let job = JobState::new(JobParent::Extraction("e1".to_string()));
        store.insert_job(&job).unwrap();
        (shared(store), Arc::new(ProgressBus::new()), job)
    }

    #[test]
    fn test_update_progress_persists_flags() {
        let (store, bus, job) = setup();
        let tracker = JobTracker::new(Arc::clone(&store), bus, &job.id);

        tracker
            .update_progress(
                "summarize",
                40,
                "Summarizing document",
                &["parsing", "chunking", "summarizing"],
                Some(("summarizing", "artifacts/sum.json")),
            )
            .unwrap();

        let loaded = with_store(&store, |s| s.get_job(&job.id)).unwrap().unwrap();
        assert_eq!(loaded.progress_percent, 40);
        assert_eq!(loaded.current_stage.as_deref(), Some("summarize"));
        assert!(loaded.stage_complete("summarizing"));
        assert_eq!(
            loaded.intermediate_artifacts.get("summarizing").map(String::as_str),
            Some("artifacts/sum.json")
        );
    }

    #[tokio::test]
    async fn test_completed_emits_complete_then_end() {
        let (store, bus, job) = setup();
        let mut rx = bus.subscribe(&job.id);
        let tracker = JobTracker::new(store, Arc::clone(&bus), &job.id);

        tracker.mark_completed().unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Complete { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::End { .. }));
    }

    #[test]
    fn test_mark_error_records_classification() {
        let (store, bus, job) = setup();
        let tracker = JobTracker::new(Arc::clone(&store), bus, &job.id);

        tracker
            .mark_error("extract_structured", "provider overloaded", StageErrorKind::LlmError)
            .unwrap();

        let loaded = with_store(&store, |s| s.get_job(&job.id)).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_stage.as_deref(), Some("extract_structured"));
        assert_eq!(loaded.error_type, Some(StageErrorKind::LlmError));
        assert_eq!(loaded.error_retryable, Some(true));
    }
}
