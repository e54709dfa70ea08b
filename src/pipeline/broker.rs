//! Task broker: a single durable queue delivering pipeline stages to
//! worker tasks.
//!
//! Ordering within a run is enforced by construction: each stage returns
//! the name of the next stage to enqueue, so a run's tasks are serialized
//! while tasks across runs execute in parallel up to the worker
//! concurrency. Retryable stage failures are re-enqueued with exponential
//! backoff (2s base, 8s cap, 3 attempts per task); non-retryable failures
//! hand the payload to the executor's failure hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use crate::error::{Error, PipelineError, Result};

/// Maximum attempts per task (initial + retries).
pub const MAX_TASK_ATTEMPTS: u32 = 3;

/// Base backoff delay in seconds.
const BACKOFF_BASE_SECS: u64 = 2;

/// Backoff cap in seconds.
const BACKOFF_CAP_SECS: u64 = 8;

/// A queued stage execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskEnvelope {
    /// Stage name (e.g. `"parse"`, `"prepare_context"`).
    pub stage: String,
    /// Durable payload: job id, parent entity id, intermediate pointers.
    pub payload: serde_json::Value,
    /// Attempt counter (1-based once executing).
    #[serde(default)]
    pub attempt: u32,
}

impl TaskEnvelope {
    /// Creates a first-attempt envelope.
    #[must_use]
    pub fn new(stage: &str, payload: serde_json::Value) -> Self {
        Self {
            stage: stage.to_string(),
            payload,
            attempt: 0,
        }
    }
}

/// Outcome of a successfully executed stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Augmented payload handed to the next stage.
    pub payload: serde_json::Value,
    /// Next stage to enqueue; `None` ends the chain.
    pub next_stage: Option<String>,
}

/// Executes stages and handles terminal failures.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes one stage against its payload.
    ///
    /// # Errors
    ///
    /// Returns an error on stage failure; the broker classifies it for
    /// retry via [`Error::stage_kind`].
    async fn execute(&self, stage: &str, payload: serde_json::Value) -> Result<StageResult>;

    /// Called when a stage fails terminally (non-retryable or attempts
    /// exhausted). Implementations mark the parent entity and job failed
    /// and emit the error event.
    async fn on_failure(&self, stage: &str, payload: serde_json::Value, error: &Error);
}

/// Single-queue task broker with bounded worker concurrency.
pub struct TaskBroker {
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

impl std::fmt::Debug for TaskBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBroker").finish()
    }
}

impl TaskBroker {
    /// Starts the broker over an executor with the given worker
    /// concurrency. The worker loop runs until the broker (and any
    /// in-flight retry re-enqueues) are dropped.
    #[must_use]
    pub fn start(executor: Arc<dyn StageExecutor>, worker_concurrency: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<TaskEnvelope>();
        let semaphore = Arc::new(Semaphore::new(worker_concurrency.max(1)));
        let requeue = sender.clone();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let executor = Arc::clone(&executor);
                let requeue = requeue.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    Self::run_task(executor, requeue, envelope).await;
                });
            }
        });

        Self { sender }
    }

    /// Enqueues a task.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BrokerStopped`] when the worker loop has
    /// shut down.
    pub fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        self.sender
            .send(envelope)
            .map_err(|_| PipelineError::BrokerStopped.into())
    }

    /// Runs one task attempt; on success enqueues the chain's next stage,
    /// on retryable failure re-enqueues itself after backoff.
    async fn run_task(
        executor: Arc<dyn StageExecutor>,
        requeue: mpsc::UnboundedSender<TaskEnvelope>,
        mut envelope: TaskEnvelope,
    ) {
        envelope.attempt += 1;
        let stage = envelope.stage.clone();
        tracing::debug!(stage = %stage, attempt = envelope.attempt, "task starting");

        match executor.execute(&stage, envelope.payload.clone()).await {
            Ok(result) => {
                if let Some(next_stage) = result.next_stage {
                    let next = TaskEnvelope::new(&next_stage, result.payload);
                    if requeue.send(next).is_err() {
                        tracing::error!(stage = %next_stage, "broker stopped, chain dropped");
                    }
                }
            }
            Err(error) => {
                let kind = error.stage_kind();
                let retryable = kind.retryable() && envelope.attempt < MAX_TASK_ATTEMPTS;
                if retryable {
                    let delay = backoff_delay(envelope.attempt);
                    tracing::warn!(
                        stage = %stage,
                        attempt = envelope.attempt,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if requeue.send(envelope).is_err() {
                        tracing::error!(stage = %stage, "broker stopped, retry dropped");
                    }
                } else {
                    tracing::error!(
                        stage = %stage,
                        attempt = envelope.attempt,
                        kind = %kind,
                        error = %error,
                        "stage failed terminally"
                    );
                    executor.on_failure(&stage, envelope.payload, &error).await;
                }
            }
        }
    }
}

/// Exponential backoff: 2s, 4s, 8s (capped).
fn backoff_delay(attempt: u32) -> Duration {
    let secs = (BACKOFF_BASE_SECS << (attempt.saturating_sub(1))).min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, RetrievalError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedExecutor {
        /// Stage log.
        log: Mutex<Vec<String>>,
        /// Failures to inject before succeeding, per stage.
        failures_left: AtomicU32,
        /// Whether the failure should be retryable.
        retryable: bool,
        /// Failure hook log.
        failed: Mutex<Vec<String>>,
        /// Signal when the chain ends.
        done: tokio::sync::Notify,
    }

    impl ScriptedExecutor {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
                retryable,
                failed: Mutex::new(Vec::new()),
                done: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, stage: &str, payload: serde_json::Value) -> Result<StageResult> {
            self.log.lock().unwrap().push(stage.to_string());

            if stage == "flaky" && self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                if self.retryable {
                    return Err(LlmError::Overloaded {
                        status: 529,
                        message: "overloaded".to_string(),
                    }
                    .into());
                }
                return Err(RetrievalError::NoChunksRetrieved.into());
            }

            let next = match stage {
                "first" => Some("second".to_string()),
                "second" | "flaky" => {
                    self.done.notify_one();
                    None
                }
                _ => None,
            };
            Ok(StageResult {
                payload,
                next_stage: next,
            })
        }

        async fn on_failure(&self, stage: &str, _payload: serde_json::Value, error: &Error) {
            self.failed
                .lock()
                .unwrap()
                .push(format!("{stage}: {error}"));
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let executor = Arc::new(ScriptedExecutor::new(0, true));
        let broker = TaskBroker::start(Arc::clone(&executor) as Arc<dyn StageExecutor>, 2);

        broker
            .enqueue(TaskEnvelope::new("first", serde_json::json!({"job_id": "j1"})))
            .unwrap();
        executor.done.notified().await;

        let log = executor.log.lock().unwrap().clone();
        assert_eq!(log, vec!["first", "second"]);
        assert!(executor.failed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_retried_with_backoff() {
        let executor = Arc::new(ScriptedExecutor::new(2, true));
        let broker = TaskBroker::start(Arc::clone(&executor) as Arc<dyn StageExecutor>, 2);

        broker
            .enqueue(TaskEnvelope::new("flaky", serde_json::json!({})))
            .unwrap();
        executor.done.notified().await;

        // Two failures then success: three executions
        assert_eq!(executor.log.lock().unwrap().len(), 3);
        assert!(executor.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let executor = Arc::new(ScriptedExecutor::new(1, false));
        let broker = TaskBroker::start(Arc::clone(&executor) as Arc<dyn StageExecutor>, 2);

        broker
            .enqueue(TaskEnvelope::new("flaky", serde_json::json!({})))
            .unwrap();
        executor.done.notified().await;

        assert_eq!(executor.log.lock().unwrap().len(), 1);
        let failed = executor.failed.lock().unwrap().clone();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].starts_with("flaky:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_calls_failure_hook() {
        let executor = Arc::new(ScriptedExecutor::new(10, true));
        let broker = TaskBroker::start(Arc::clone(&executor) as Arc<dyn StageExecutor>, 2);

        broker
            .enqueue(TaskEnvelope::new("flaky", serde_json::json!({})))
            .unwrap();
        executor.done.notified().await;

        assert_eq!(executor.log.lock().unwrap().len() as u32, MAX_TASK_ATTEMPTS);
        assert_eq!(executor.failed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        // Capped
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
    }
}
