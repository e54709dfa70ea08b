//! LLM client stack: provider abstraction, transport, retries, parsing,
//! and cost accounting.

mod client;
mod cost;
mod message;
mod openai;
mod provider;
mod repair;

pub use client::{Extraction, LlmClient, is_retryable, truncate_to};
pub use cost::compute_cost;
pub use message::{
    ChatMessage, CompletionRequest, CompletionResponse, Role, StreamEvent, TokenUsage,
    system_message, user_message,
};
pub use openai::OpenAiProvider;
pub use provider::{EventStream, LlmProvider, create_provider};
pub use repair::{fix_common_json_errors, parse_json_response};
