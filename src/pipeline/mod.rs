//! Pipeline runtime: durable, resumable task chains with progress
//! streaming.
//!
//! A single broker delivers stages to worker tasks; each stage enqueues
//! its successor, so a run's stages are strictly ordered while runs
//! execute in parallel. `JobState` records per-stage completion and the
//! keys of intermediate artifacts, making failed runs resumable from the
//! last expensive stage.

mod broker;
mod events;
mod tasks;
mod tracker;

pub use broker::{MAX_TASK_ATTEMPTS, StageExecutor, StageResult, TaskBroker, TaskEnvelope};
pub use events::{ProgressBus, ProgressEvent};
pub use tasks::{ExtractionSubmission, PipelineEngine, TemplateFillOps};
pub use tracker::JobTracker;
