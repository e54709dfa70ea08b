//! Conversation memory with cached summarization.
//!
//! When a session's message count exceeds the threshold, everything but
//! the last N verbatim messages is summarized via a cheap LLM call. The
//! summary (text + key facts + last-summarized index) is cached on the
//! session and reused until the count moves past the cached index.

use crate::core::{ChatMessage, ChatSession, ConversationSummary};
use crate::error::Result;
use crate::llm::LlmClient;
use crate::storage::{SharedStore, with_store};

/// Loaded history for one chat turn.
#[derive(Debug, Clone)]
pub struct LoadedHistory {
    /// Conversation summary covering older messages, when present.
    pub summary_text: Option<String>,
    /// Key facts extracted alongside the summary.
    pub key_facts: Vec<String>,
    /// Verbatim recent messages.
    pub recent_messages: Vec<ChatMessage>,
    /// Index written back to the session cache when a fresh summary was
    /// produced this turn.
    pub new_summary: Option<ConversationSummary>,
}

/// Conversation memory component.
pub struct ConversationMemory<'a> {
    llm: &'a LlmClient,
    /// Verbatim messages kept out of the summary.
    pub verbatim_count: usize,
    /// Message count above which history is summarized.
    pub summarize_threshold: usize,
}

impl<'a> ConversationMemory<'a> {
    /// Creates a memory component.
    #[must_use]
    pub const fn new(llm: &'a LlmClient, verbatim_count: usize, summarize_threshold: usize) -> Self {
        Self {
            llm,
            verbatim_count,
            summarize_threshold,
        }
    }

    /// Loads history and summarizes when the verbatim window is exceeded.
    /// Reuses the cached summary while it still covers the right prefix.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures. Summarization failures degrade
    /// to unsummarized history.
    pub async fn load(&self, session: &ChatSession, store: &SharedStore) -> Result<LoadedHistory> {
        let messages = with_store(store, |s| s.get_messages(&session.id))?;

        if messages.len() <= self.summarize_threshold {
            return Ok(LoadedHistory {
                summary_text: None,
                key_facts: Vec::new(),
                recent_messages: messages,
                new_summary: None,
            });
        }

        let split = messages.len().saturating_sub(self.verbatim_count);

        // Cached summary still valid while the count hasn't moved past it
        if let Some(cached) = session.summary.as_ref()
            && cached.last_summarized_index >= split
        {
            let recent = messages
                .get(cached.last_summarized_index..)
                .map(<[ChatMessage]>::to_vec)
                .unwrap_or_default();
            tracing::debug!(
                session_id = %session.id,
                last_summarized_index = cached.last_summarized_index,
                "reusing cached conversation summary"
            );
            return Ok(LoadedHistory {
                summary_text: Some(cached.text.clone()),
                key_facts: cached.key_facts.clone(),
                recent_messages: recent,
                new_summary: None,
            });
        }

        let (older, recent) = messages.split_at(split);
        match self.summarize(older).await {
            Ok((text, key_facts)) => {
                let summary = ConversationSummary {
                    text: text.clone(),
                    key_facts: key_facts.clone(),
                    last_summarized_index: split,
                };
                Ok(LoadedHistory {
                    summary_text: Some(text),
                    key_facts,
                    recent_messages: recent.to_vec(),
                    new_summary: Some(summary),
                })
            }
            Err(e) => {
                // A failed summary is not fatal; proceed with full history
                tracing::warn!(session_id = %session.id, error = %e, "summarization failed");
                Ok(LoadedHistory {
                    summary_text: None,
                    key_facts: Vec::new(),
                    recent_messages: messages,
                    new_summary: None,
                })
            }
        }
    }

    /// Summarizes older messages into (summary text, key facts).
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<(String, Vec<String>)> {
        let transcript: String = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Summarize this conversation between a user and a document analysis assistant. \
             Preserve concrete facts (figures, names, dates). \
             Return JSON: {{\"summary\": str, \"key_facts\": [str]}}\n\n{transcript}"
        );

        let extraction = self
            .llm
            .cheap_json(None, &prompt)
            .await
            .map_err(crate::Error::from)?;
        let summary = extraction.parsed["summary"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let key_facts = extraction.parsed["key_facts"]
            .as_array()
            .map(|facts| {
                facts
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok((summary, key_facts))
    }
}

/// Persists a freshly produced summary on the session (last-writer-wins).
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn cache_summary(
    store: &SharedStore,
    session_id: &str,
    summary: &ConversationSummary,
) -> Result<()> {
    with_store(store, |s| s.update_session_summary(session_id, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageRole;

    // The summarization LLM call itself is covered by integration tests
    // with a mock provider; here we exercise the windowing logic through
    // the cached-summary path, which needs no LLM.

    fn session_with_summary(message_count: usize, last_summarized: usize) -> ChatSession {
        let mut session = ChatSession::new("u1", "org1", None);
        session.message_count = message_count;
        session.summary = Some(ConversationSummary {
            text: "Earlier: discussed cap rates.".to_string(),
            key_facts: vec!["cap rate 5.2%".to_string()],
            last_summarized_index: last_summarized,
        });
        session
    }

    fn store_with_messages(session: &ChatSession, count: usize) -> SharedStore {
        let mut store = crate::storage::SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        store.insert_session(session).unwrap();
        for i in 0..count / 2 {
            let user = ChatMessage::new(&session.id, MessageRole::User, &format!("q{i}"));
            let assistant = ChatMessage::new(&session.id, MessageRole::Assistant, &format!("a{i}"));
            store.append_chat_turn(&user, &assistant).unwrap();
        }
        crate::storage::shared(store)
    }

    #[tokio::test]
    async fn test_short_history_unsummarized() {
        let session = ChatSession::new("u1", "org1", None);
        let store = store_with_messages(&session, 4);
        let config = crate::config::EngineConfig::builder()
            .api_key("test")
            .data_dir("/tmp/dossier-test")
            .build()
            .unwrap();
        let provider = crate::llm::create_provider(&config).unwrap();
        let llm = LlmClient::new(provider, &config);
        let memory = ConversationMemory::new(&llm, 6, 12);

        let history = memory.load(&session, &store).await.unwrap();
        assert!(history.summary_text.is_none());
        assert_eq!(history.recent_messages.len(), 4);
        assert!(history.new_summary.is_none());
    }

    #[tokio::test]
    async fn test_cached_summary_reused() {
        // 16 messages, verbatim window 6 -> split at 10; cache covers 10
        let session = session_with_summary(16, 10);
        let store = store_with_messages(&session, 16);
        let config = crate::config::EngineConfig::builder()
            .api_key("test")
            .data_dir("/tmp/dossier-test")
            .build()
            .unwrap();
        let provider = crate::llm::create_provider(&config).unwrap();
        let llm = LlmClient::new(provider, &config);
        let memory = ConversationMemory::new(&llm, 6, 12);

        let history = memory.load(&session, &store).await.unwrap();
        assert_eq!(
            history.summary_text.as_deref(),
            Some("Earlier: discussed cap rates.")
        );
        assert_eq!(history.recent_messages.len(), 6);
        assert!(history.new_summary.is_none());
        assert_eq!(history.key_facts, vec!["cap rate 5.2%"]);
    }

    #[test]
    fn test_summary_invariant_holds_for_cache() {
        // last_summarized_index <= message_count - verbatim_count
        let session = session_with_summary(16, 10);
        let cached = session.summary.unwrap();
        assert!(cached.last_summarized_index <= session.message_count - 6);
    }
}
