//! Provider-agnostic message types for LLM communication.
//!
//! These types decouple the engine from any specific LLM SDK, allowing the
//! same call sites to work across `OpenAI`-compatible providers.

use serde::{Deserialize, Serialize};

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Message content.
    pub content: String,
}

/// A chat completion request (provider-agnostic).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier (e.g., "gpt-5.2-2025-12-11").
    pub model: String,
    /// Ordered conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Request JSON-object output (no schema).
    pub json_mode: bool,
    /// Structured-output schema: (name, JSON schema). The provider
    /// guarantees the response conforms.
    pub response_schema: Option<(String, serde_json::Value)>,
    /// Keep the system prompt byte-stable so provider-side prompt caching
    /// can engage across calls.
    pub cacheable_system: bool,
}

impl CompletionRequest {
    /// Creates a request with a user message and optional system prompt.
    #[must_use]
    pub fn new(model: &str, system: Option<&str>, user: &str) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: Role::System,
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: user.to_string(),
        });
        Self {
            model: model.to_string(),
            messages,
            temperature: Some(0.0),
            max_tokens: None,
            json_mode: false,
            response_schema: None,
            cacheable_system: false,
        }
    }
}

/// Token usage statistics from a completion, including prompt-cache
/// counters when the provider reports them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
    /// Prompt tokens read from the provider's prompt cache.
    #[serde(default)]
    pub cache_read_tokens: u32,
    /// Prompt tokens written to the provider's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: u32,
}

impl TokenUsage {
    /// Adds another usage record into this one (saturating).
    pub fn absorb(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
    }
}

/// A chat completion response (provider-agnostic).
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated text content.
    pub content: String,
    /// Token usage statistics.
    pub usage: TokenUsage,
    /// Model that produced the response.
    pub model: String,
    /// Finish reason from the model (e.g., `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// An item emitted by a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta.
    Delta(String),
    /// Final usage report; always the last event before the stream ends.
    Usage(TokenUsage),
}

/// Creates a system message.
#[must_use]
pub fn system_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.to_string(),
    }
}

/// Creates a user message.
#[must_use]
pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_with_system() {
        let req = CompletionRequest::new("gpt-5.2-2025-12-11", Some("be terse"), "hello");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].role, Role::User);
        assert_eq!(req.temperature, Some(0.0));
    }

    #[test]
    fn test_request_without_system() {
        let req = CompletionRequest::new("gpt-5-mini-2025-08-07", None, "hello");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn test_usage_absorb() {
        let mut total = TokenUsage::default();
        total.absorb(&TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cache_read_tokens: 80,
            cache_write_tokens: 0,
        });
        total.absorb(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cache_read_tokens: 0,
            cache_write_tokens: 20,
        });
        assert_eq!(total.prompt_tokens, 110);
        assert_eq!(total.total_tokens, 165);
        assert_eq!(total.cache_read_tokens, 80);
        assert_eq!(total.cache_write_tokens, 20);
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::System).unwrap_or_default();
        assert_eq!(json, "\"system\"");
    }
}
