//! High-level LLM client: retries, timeouts, truncation, parsing, cost.
//!
//! Three call surfaces sit on top of [`LlmProvider`]:
//!
//! 1. Unstructured structured-extraction: parse JSON out of a completion,
//!    repairing common issues.
//! 2. Schema-enforced structured output: the provider guarantees
//!    conformance; a parse failure here is a schema violation.
//! 3. Streaming chat: text deltas relayed incrementally with a final usage
//!    event.
//!
//! All surfaces retry transient provider failures with exponential backoff
//! (2s, 4s, 8s), enforce the read timeout, truncate oversize inputs by
//! keeping the first 80% and last 20%, and record token usage, cache
//! counters, and USD cost.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;

use super::cost::compute_cost;
use super::message::{CompletionRequest, CompletionResponse, StreamEvent, TokenUsage};
use super::provider::LlmProvider;
use super::repair::parse_json_response;
use crate::config::EngineConfig;
use crate::error::LlmError;

/// Base retry delay in seconds (doubles per attempt: 2s, 4s, 8s).
const RETRY_BASE_SECS: u64 = 2;

/// Result of a structured extraction call.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Parsed JSON payload.
    pub parsed: serde_json::Value,
    /// Raw response text.
    pub raw_text: String,
    /// Token usage including cache counters.
    pub usage: TokenUsage,
    /// Model that produced the response.
    pub model: String,
    /// USD cost, when the model is in the pricing table.
    pub cost_usd: Option<f64>,
}

/// High-level LLM client.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    synthesis_model: String,
    cheap_model: String,
    max_tokens: u32,
    cheap_max_tokens: u32,
    max_input_chars: usize,
    timeout: Duration,
    max_retries: u32,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("synthesis_model", &self.synthesis_model)
            .field("cheap_model", &self.cheap_model)
            .finish()
    }
}

impl LlmClient {
    /// Creates a client over the given provider and configuration.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, config: &EngineConfig) -> Self {
        Self {
            provider,
            synthesis_model: config.synthesis_model.clone(),
            cheap_model: config.cheap_model.clone(),
            max_tokens: config.max_tokens,
            cheap_max_tokens: config.cheap_max_tokens,
            max_input_chars: config.max_input_chars,
            timeout: config.timeout,
            max_retries: config.max_retries,
        }
    }

    /// The synthesis model id.
    #[must_use]
    pub fn synthesis_model(&self) -> &str {
        &self.synthesis_model
    }

    /// The cheap model id.
    #[must_use]
    pub fn cheap_model(&self) -> &str {
        &self.cheap_model
    }

    /// Smart-truncates oversize input, keeping the first 80% and last 20%
    /// of the budget with an explicit marker between.
    #[must_use]
    pub fn truncate_input(&self, text: &str) -> String {
        truncate_to(text, self.max_input_chars)
    }

    /// Submits a prompt and parses JSON out of the response, repairing
    /// common formatting issues.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails after retries or no parsable
    /// JSON can be recovered.
    pub async fn extract_structured(
        &self,
        text: &str,
        system_prompt: Option<&str>,
        use_cache: bool,
    ) -> Result<Extraction, LlmError> {
        let text = self.truncate_input(text);
        let mut request = CompletionRequest::new(&self.synthesis_model, system_prompt, &text);
        request.max_tokens = Some(self.max_tokens);
        request.json_mode = true;
        request.cacheable_system = use_cache;

        let response = self.complete_with_retry(&request).await?;
        let parsed = parse_json_response(&response.content)?;
        Ok(Self::extraction(parsed, response))
    }

    /// Submits with a concrete output schema; the provider guarantees the
    /// returned object conforms.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::SchemaViolation`] if the (guaranteed) output
    /// does not parse — a provider-boundary fault.
    pub async fn extract_with_schema(
        &self,
        text: &str,
        system_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
        use_cache: bool,
    ) -> Result<Extraction, LlmError> {
        let text = self.truncate_input(text);
        let mut request = CompletionRequest::new(&self.synthesis_model, Some(system_prompt), &text);
        request.max_tokens = Some(self.max_tokens);
        request.response_schema = Some((schema_name.to_string(), schema));
        request.cacheable_system = use_cache;

        let response = self.complete_with_retry(&request).await?;
        if response.finish_reason.as_deref() == Some("length") {
            tracing::warn!(
                max_tokens = self.max_tokens,
                "structured response truncated at max_tokens"
            );
        }
        let parsed =
            serde_json::from_str(&response.content).map_err(|e| LlmError::SchemaViolation {
                message: format!("structured output failed to parse: {e}"),
            })?;
        Ok(Self::extraction(parsed, response))
    }

    /// Cheap-model call that parses JSON out of the response. Used for
    /// query understanding, conversation summarization, and map-phase
    /// section briefs.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails after retries or no parsable
    /// JSON can be recovered.
    pub async fn cheap_json(
        &self,
        system_prompt: Option<&str>,
        text: &str,
    ) -> Result<Extraction, LlmError> {
        let text = self.truncate_input(text);
        let mut request = CompletionRequest::new(&self.cheap_model, system_prompt, &text);
        request.max_tokens = Some(self.cheap_max_tokens);
        request.json_mode = true;

        let response = self.complete_with_retry(&request).await?;
        let parsed = parse_json_response(&response.content)?;
        Ok(Self::extraction(parsed, response))
    }

    /// Cheap-model plain-text completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails after retries.
    pub async fn cheap_text(&self, text: &str) -> Result<(String, TokenUsage), LlmError> {
        let text = self.truncate_input(text);
        let mut request = CompletionRequest::new(&self.cheap_model, None, &text);
        request.max_tokens = Some(self.cheap_max_tokens);

        let response = self.complete_with_retry(&request).await?;
        Ok((response.content, response.usage))
    }

    /// Streams a chat completion. Text deltas arrive in model order; a
    /// [`StreamEvent::Usage`] is always the final item — estimated from
    /// accumulated text when the provider does not report stream usage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    pub async fn stream_chat(
        &self,
        prompt: &str,
    ) -> Result<ReceiverStream<Result<StreamEvent, LlmError>>, LlmError> {
        let prompt = self.truncate_input(prompt);
        let mut request = CompletionRequest::new(&self.synthesis_model, None, &prompt);
        request.max_tokens = Some(self.max_tokens);

        let upstream = self.provider.stream(&request).await?;
        let prompt_len = prompt.len();

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut upstream = upstream;
            let mut usage_seen = false;
            let mut streamed_chars = 0usize;

            while let Some(item) = upstream.next().await {
                match &item {
                    Ok(StreamEvent::Usage(_)) => usage_seen = true,
                    Ok(StreamEvent::Delta(text)) => streamed_chars += text.len(),
                    Err(_) => {}
                }
                if tx.send(item).await.is_err() {
                    // Consumer went away (client disconnect); stop pulling.
                    return;
                }
            }

            if !usage_seen {
                #[allow(clippy::cast_possible_truncation)]
                let estimate = TokenUsage {
                    prompt_tokens: (prompt_len / 4) as u32,
                    completion_tokens: (streamed_chars / 4) as u32,
                    total_tokens: ((prompt_len + streamed_chars) / 4) as u32,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                };
                let _ = tx.send(Ok(StreamEvent::Usage(estimate))).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Runs a completion with timeout and retry-with-backoff on transient
    /// failures (429, 5xx, overload, timeout).
    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..self.max_retries {
            let call = self.provider.complete(request);
            let result = tokio::time::timeout(self.timeout, call).await;

            let error = match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout {
                    seconds: self.timeout.as_secs(),
                },
            };

            if is_retryable(&error) && attempt + 1 < self.max_retries {
                let wait = Duration::from_secs(RETRY_BASE_SECS << attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = self.max_retries,
                    wait_secs = wait.as_secs(),
                    error = %error,
                    "provider error, retrying"
                );
                tokio::time::sleep(wait).await;
                last_error = Some(error);
            } else {
                return Err(error);
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries,
            last_error: last_error.map_or_else(String::new, |e| e.to_string()),
        })
    }

    fn extraction(parsed: serde_json::Value, response: CompletionResponse) -> Extraction {
        let cost_usd = compute_cost(
            &response.model,
            u64::from(response.usage.prompt_tokens),
            u64::from(response.usage.completion_tokens),
        );
        Extraction {
            parsed,
            raw_text: response.content,
            usage: response.usage,
            model: response.model,
            cost_usd,
        }
    }
}

/// Whether a provider error is transient and worth retrying.
#[must_use]
pub fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Overloaded { .. } | LlmError::Timeout { .. } => true,
        LlmError::ApiRequest { message, status } => {
            if let Some(status) = status {
                return *status == 429 || *status >= 500;
            }
            let lower = message.to_lowercase();
            lower.contains("429")
                || lower.contains("529")
                || lower.contains("overloaded")
                || lower.contains("rate limit")
                || lower.contains("timeout")
        }
        _ => false,
    }
}

/// Keeps the first 80% and last 20% of the character budget with an
/// explicit truncation marker between, honoring UTF-8 boundaries.
#[must_use]
pub fn truncate_to(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let chars_cut = text.len() - max_chars;
    let keep_start = floor_char_boundary(text, max_chars * 8 / 10);
    let keep_end = floor_char_boundary(text, text.len() - max_chars / 5);

    tracing::warn!(
        original = text.len(),
        truncated = max_chars,
        removed = chars_cut,
        "input truncated"
    );

    format!(
        "{}\n\n... [TRUNCATED: {chars_cut} characters removed from middle section] ...\n\n{}",
        &text[..keep_start],
        &text[keep_end..]
    )
}

/// Finds a valid UTF-8 character boundary at or before the given position.
fn floor_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut boundary = pos;
    while !s.is_char_boundary(boundary) && boundary > 0 {
        boundary -= 1;
    }
    boundary
}
