//! Pluggable LLM provider trait.
//!
//! Implementations translate provider-agnostic [`CompletionRequest`] /
//! [`CompletionResponse`] into provider-specific SDK calls. This keeps the
//! workflow engine and chat orchestrator decoupled from any particular
//! LLM vendor.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use super::message::{CompletionRequest, CompletionResponse, StreamEvent};
use crate::error::LlmError;

/// A pinned, boxed stream of completion events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer (HTTP, SDK calls) for a
/// specific provider while presenting a uniform interface. Retry and
/// timeout policy live in [`super::LlmClient`], not here.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., `"openai"`).
    fn name(&self) -> &'static str;

    /// Executes a chat completion request.
    ///
    /// When `request.response_schema` is set, the returned content is
    /// guaranteed schema-conformant (enforced at the provider boundary).
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on API failures or parse errors.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Executes a streaming chat completion request.
    ///
    /// Yields text deltas in model order; providers that report stream
    /// usage emit a final [`StreamEvent::Usage`].
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on connection or streaming failures.
    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, LlmError>;
}

/// Creates an [`LlmProvider`] based on the configured provider name.
///
/// # Supported Providers
///
/// - `"openai"` (default) — OpenAI-compatible APIs via `async-openai`
///
/// # Errors
///
/// Returns [`LlmError::UnsupportedProvider`] for unknown provider names.
pub fn create_provider(
    config: &crate::config::EngineConfig,
) -> Result<std::sync::Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "openai" => Ok(std::sync::Arc::new(super::openai::OpenAiProvider::new(
            &config.api_key,
            config.base_url.as_deref(),
        ))),
        other => Err(LlmError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}
