//! Chat sessions and their append-only message logs.

use serde::{Deserialize, Serialize};

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user input.
    User,
    /// Model response.
    Assistant,
}

impl MessageRole {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Cached conversation summary, recomputed when the verbatim window is
/// exceeded. A stale summary is acceptable (last-writer-wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Summary text covering messages before the verbatim window.
    pub text: String,
    /// Key facts extracted alongside the summary.
    #[serde(default)]
    pub key_facts: Vec<String>,
    /// Index of the last message covered by the summary.
    pub last_summarized_index: usize,
}

/// A conversational context over a set of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// Session id (UUID v4).
    pub id: String,
    /// Owning user id.
    pub user_id: String,
    /// Owning organization id.
    pub org_id: String,
    /// Optional collection scoping retrieval.
    pub collection_id: Option<String>,
    /// Documents attached to this session.
    pub document_ids: Vec<String>,
    /// Number of messages in the session.
    pub message_count: usize,
    /// Cached conversation summary, if computed.
    pub summary: Option<ConversationSummary>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl ChatSession {
    /// Creates a new empty session.
    #[must_use]
    pub fn new(user_id: &str, org_id: &str, collection_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            collection_id,
            document_ids: Vec::new(),
            message_count: 0,
            summary: None,
            created_at: super::current_timestamp(),
        }
    }
}

/// An entry in a session's ordered, append-only message log.
///
/// Never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id (UUID v4).
    pub id: String,
    /// Owning session id.
    pub session_id: String,
    /// Author role.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Chunk ids the assistant grounded its answer on.
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    /// Token usage for the exchange, as reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
    /// Comparison payload attached to comparison answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_metadata: Option<serde_json::Value>,
    /// Citation context for UI highlighting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_context: Option<serde_json::Value>,
    /// Unix timestamp of the write.
    pub created_at: i64,
}

impl ChatMessage {
    /// Creates a message for the given session.
    #[must_use]
    pub fn new(session_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            source_chunk_ids: Vec::new(),
            usage: None,
            comparison_metadata: None,
            citation_context: None,
            created_at: super::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!(MessageRole::parse("user"), Some(MessageRole::User));
        assert_eq!(MessageRole::parse("assistant"), Some(MessageRole::Assistant));
        assert!(MessageRole::parse("system").is_none());
    }

    #[test]
    fn test_new_session() {
        let session = ChatSession::new("u1", "org1", None);
        assert_eq!(session.message_count, 0);
        assert!(session.summary.is_none());
        assert!(session.document_ids.is_empty());
    }

    #[test]
    fn test_new_message() {
        let msg = ChatMessage::new("s1", MessageRole::User, "What is the cap rate?");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.session_id, "s1");
        assert!(msg.source_chunk_ids.is_empty());
    }

    #[test]
    fn test_summary_serialization() {
        let summary = ConversationSummary {
            text: "Discussed cap rates.".to_string(),
            key_facts: vec!["Cap rate 5.2%".to_string()],
            last_summarized_index: 4,
        };
        let json = serde_json::to_string(&summary).unwrap();
        let back: ConversationSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }
}
