//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, local proxies)
//! via the base URL override in configuration.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, ChatCompletionStreamOptions, CreateChatCompletionRequest,
    CreateChatCompletionStreamResponse, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::error::LlmError;
use crate::llm::message::{
    ChatMessage, CompletionRequest, CompletionResponse, Role, StreamEvent, TokenUsage,
};
use crate::llm::provider::{EventStream, LlmProvider};

/// `OpenAI`-compatible LLM provider.
///
/// Wraps the `async-openai` client for chat completions. Compatible with
/// any API that follows the `OpenAI` chat completion spec. Prompt caching
/// is provider-automatic: keeping the system prompt byte-stable lets the
/// provider serve cached prefix tokens, reported as `cache_read_tokens`.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates a new provider.
    #[must_use]
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(base_url) = base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        Self {
            client: Client::with_config(openai_config),
        }
    }

    /// Converts our message type to the `OpenAI` SDK type.
    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        msg.content.clone(),
                    ),
                    name: None,
                })
            }
            Role::User | Role::Assistant => {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                        msg.content.clone(),
                    ),
                    name: None,
                })
            }
        }
    }

    /// Builds an `OpenAI` chat completion request from our generic request.
    fn build_request(request: &CompletionRequest, stream: bool) -> CreateChatCompletionRequest {
        let messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();

        let response_format = request.response_schema.as_ref().map_or_else(
            || request.json_mode.then_some(ResponseFormat::JsonObject),
            |(name, schema)| {
                Some(ResponseFormat::JsonSchema {
                    json_schema: ResponseFormatJsonSchema {
                        description: None,
                        name: name.clone(),
                        schema: Some(schema.clone()),
                        strict: Some(true),
                    },
                })
            },
        );

        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature.filter(|&t| t != 0.0),
            max_completion_tokens: request.max_tokens,
            stream: if stream { Some(true) } else { None },
            stream_options: stream.then_some(ChatCompletionStreamOptions { include_usage: true }),
            response_format,
            ..Default::default()
        }
    }

    fn convert_usage(usage: Option<&async_openai::types::CompletionUsage>) -> TokenUsage {
        usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
            cache_read_tokens: u
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0),
            // OpenAI-style automatic caching has no write counter
            cache_write_tokens: 0,
        })
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<async-openai::Client>")
            .finish()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let openai_request = Self::build_request(request, false);

        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: e.to_string(),
                status: None,
            })?;

        let choice = response.choices.first();

        let content = choice
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let finish_reason = choice.and_then(|c| {
            c.finish_reason
                .as_ref()
                .map(|fr| format!("{fr:?}").to_lowercase())
        });

        Ok(CompletionResponse {
            content,
            usage: Self::convert_usage(response.usage.as_ref()),
            model: response.model,
            finish_reason,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, LlmError> {
        let openai_request = Self::build_request(request, true);

        let stream = self
            .client
            .chat()
            .create_stream(openai_request)
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: e.to_string(),
                status: None,
            })?;

        let mapped = stream.filter_map(
            |result: Result<
                CreateChatCompletionStreamResponse,
                async_openai::error::OpenAIError,
            >| async move {
                match result {
                    Ok(response) => {
                        // Usage arrives on a trailing chunk with no choices
                        if let Some(usage) = response.usage.as_ref() {
                            return Some(Ok(StreamEvent::Usage(Self::convert_usage(Some(usage)))));
                        }
                        let text = response
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_ref())
                            .cloned()
                            .unwrap_or_default();
                        if text.is_empty() {
                            None
                        } else {
                            Some(Ok(StreamEvent::Delta(text)))
                        }
                    }
                    Err(e) => Some(Err(LlmError::Stream {
                        message: e.to_string(),
                    })),
                }
            },
        );

        Ok(Box::pin(mapped))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::llm::message;

    #[test]
    fn test_convert_system_message() {
        let msg = message::system_message("test");
        let converted = OpenAiProvider::convert_message(&msg);
        assert!(matches!(converted, ChatCompletionRequestMessage::System(_)));
    }

    #[test]
    fn test_convert_user_message() {
        let msg = message::user_message("hello");
        let converted = OpenAiProvider::convert_message(&msg);
        assert!(matches!(converted, ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_build_request_json_mode() {
        let mut request = CompletionRequest::new("gpt-5.2-2025-12-11", None, "test");
        request.json_mode = true;
        let built = OpenAiProvider::build_request(&request, false);
        assert!(matches!(
            built.response_format,
            Some(ResponseFormat::JsonObject)
        ));
        assert!(built.stream.is_none());
    }

    #[test]
    fn test_build_request_schema_wins_over_json_mode() {
        let mut request = CompletionRequest::new("gpt-5.2-2025-12-11", None, "test");
        request.json_mode = true;
        request.response_schema = Some((
            "investment_memo".to_string(),
            serde_json::json!({"type": "object"}),
        ));
        let built = OpenAiProvider::build_request(&request, false);
        match built.response_format {
            Some(ResponseFormat::JsonSchema { json_schema }) => {
                assert_eq!(json_schema.name, "investment_memo");
                assert_eq!(json_schema.strict, Some(true));
            }
            other => panic!("expected JsonSchema format, got {other:?}"),
        }
    }

    #[test]
    fn test_build_request_streaming_requests_usage() {
        let request = CompletionRequest::new("gpt-5.2-2025-12-11", None, "test");
        let built = OpenAiProvider::build_request(&request, true);
        assert_eq!(built.stream, Some(true));
        assert!(built.stream_options.is_some());
    }

    #[test]
    fn test_zero_temperature_omitted() {
        let request = CompletionRequest::new("gpt-5.2-2025-12-11", None, "test");
        let built = OpenAiProvider::build_request(&request, false);
        assert!(built.temperature.is_none());
    }
}
