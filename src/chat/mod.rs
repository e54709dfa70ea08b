//! Chat orchestrator: streaming RAG responses grounded in a session's
//! documents.
//!
//! Per message: validate and clamp, load/summarize history, short-circuit
//! low-signal messages, understand the query, branch to the comparison
//! flow when detected, otherwise hybrid-retrieve + re-rank + expand,
//! enforce the context budget, build the prompt, stream the answer, and
//! persist the turn atomically.

mod budget;
mod compare;
mod matcher;
mod memory;
mod signal;
mod understand;

pub use budget::{BudgetEnforcer, DEFAULT_PROMPT_BUDGET_CHARS};
pub use compare::{
    ChunkCluster, ChunkPair, ComparisonContext, ComparisonRetriever, DocumentLabel,
};
pub use matcher::match_entities_to_documents;
pub use memory::{ConversationMemory, LoadedHistory, cache_summary};
pub use signal::{canned_response, is_low_signal};
pub use understand::QueryUnderstandingService;

use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;

use crate::config::EngineConfig;
use crate::core::{ChatMessage, ChatSession, MessageRole};
use crate::error::{ChatError, Result, StorageError};
use crate::llm::{LlmClient, StreamEvent, TokenUsage};
use crate::retrieval::{
    ContextExpander, HybridRetriever, QueryType, QueryUnderstanding, Reranker, RetrievalSizing,
    RetrievedChunk,
};
use crate::storage::{ChunkFilter, SharedStore, with_store};

/// Marker appended to a partial response interrupted by a stream error.
const INTERRUPTION_MARKER: &str = "\n\n[Error: Response was interrupted due to technical issues]";

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Requested chunk count; out-of-range values clamp to the default.
    pub num_chunks: Option<i64>,
    /// Requested similarity threshold; out-of-range values clamp to 0.
    pub similarity_threshold: Option<f32>,
    /// Skip comparison detection: `Some(true)` forces the comparison flow,
    /// `Some(false)` suppresses it.
    pub force_comparison: Option<bool>,
    /// Client-selected documents after a `selection_needed` round trip.
    pub selected_document_ids: Option<Vec<String>>,
}

/// Events emitted by the chat stream.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A streamed answer token.
    Token(String),
    /// Citation context for UI highlighting, emitted before tokens.
    CitationContext(serde_json::Value),
    /// Comparison needs a client-side document selection.
    ComparisonSelection(serde_json::Value),
    /// Comparison payload (pairs/clusters/unpaired) for client rendering.
    ComparisonContext(serde_json::Value),
    /// Final token usage.
    Usage(TokenUsage),
    /// Terminal error.
    Error {
        /// Error description.
        message: String,
    },
    /// Stream end; always the final event.
    End,
}

impl ChatEvent {
    /// Formats the event as Server-Sent-Event lines.
    #[must_use]
    pub fn to_sse(&self) -> String {
        match self {
            Self::Token(text) => format!(
                "data: {}\n\n",
                serde_json::json!({ "type": "chunk", "text": text })
            ),
            Self::CitationContext(payload) => {
                format!("event: citation_context\ndata: {payload}\n\n")
            }
            Self::ComparisonSelection(payload) => {
                format!("event: comparison_selection\ndata: {payload}\n\n")
            }
            Self::ComparisonContext(payload) => {
                format!("event: comparison_context\ndata: {payload}\n\n")
            }
            Self::Usage(usage) => format!(
                "event: usage\ndata: {}\n\n",
                serde_json::to_string(usage).unwrap_or_default()
            ),
            Self::Error { message } => format!(
                "event: error\ndata: {}\n\n",
                serde_json::json!({ "message": message })
            ),
            Self::End => "event: end\ndata: {}\n\n".to_string(),
        }
    }
}

/// The chat orchestrator. Cheap to clone; all heavy state is shared.
pub struct ChatOrchestrator {
    store: SharedStore,
    llm: Arc<LlmClient>,
    retriever: HybridRetriever,
    reranker: Reranker,
    config: EngineConfig,
}

impl Clone for ChatOrchestrator {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            llm: Arc::clone(&self.llm),
            retriever: self.retriever.clone(),
            reranker: self.reranker.clone(),
            config: self.config.clone(),
        }
    }
}

impl ChatOrchestrator {
    /// Creates an orchestrator over the shared components.
    #[must_use]
    pub fn new(
        store: SharedStore,
        llm: Arc<LlmClient>,
        retriever: HybridRetriever,
        reranker: Reranker,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            llm,
            retriever,
            reranker,
            config,
        }
    }

    /// Produces the streaming response for one user message.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::EmptyMessage`] for empty input and storage
    /// errors for unknown sessions. Later failures surface as `Error`
    /// events on the stream, always followed by `End`.
    pub async fn chat(
        &self,
        session_id: &str,
        user_message: &str,
        options: ChatOptions,
    ) -> Result<ReceiverStream<ChatEvent>> {
        // Step 1: validation and clamping
        if user_message.trim().is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }
        let options = self.clamp(options);

        let session = with_store(&self.store, |s| s.get_session(session_id))?
            .ok_or_else(|| StorageError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let (tx, rx) = tokio::sync::mpsc::channel::<ChatEvent>(64);
        let orchestrator = self.clone();
        let user_message = user_message.to_string();

        tokio::spawn(async move {
            let result = orchestrator
                .run_pipeline(&session, &user_message, &options, &tx)
                .await;
            if let Err(e) = result {
                tracing::error!(session_id = %session.id, error = %e, "chat pipeline failed");
                let _ = tx
                    .send(ChatEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
            let _ = tx.send(ChatEvent::End).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Clamps out-of-range parameters to defaults with a warning.
    fn clamp(&self, mut options: ChatOptions) -> ChatOptions {
        if let Some(n) = options.num_chunks
            && n <= 0
        {
            tracing::warn!(num_chunks = n, "invalid num_chunks, using default");
            options.num_chunks = None;
        }
        if let Some(threshold) = options.similarity_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            tracing::warn!(threshold, "invalid similarity_threshold, using default");
            options.similarity_threshold = Some(0.0);
        }
        options
    }

    #[allow(clippy::too_many_lines)]
    async fn run_pipeline(
        &self,
        session: &ChatSession,
        user_message: &str,
        options: &ChatOptions,
        tx: &tokio::sync::mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        // Step 2: history and summarization
        let memory = ConversationMemory::new(
            &self.llm,
            self.config.verbatim_message_count,
            self.config.summarize_threshold,
        );
        let history = memory.load(session, &self.store).await?;
        if let Some(ref summary) = history.new_summary {
            cache_summary(&self.store, &session.id, summary)?;
        }

        // Step 3: low-signal short-circuit (no retrieval, no LLM)
        if is_low_signal(user_message) {
            let reply = canned_response(user_message);
            let _ = tx.send(ChatEvent::Token(reply.to_string())).await;
            self.persist_turn(session, user_message, reply, &[], None, None, None)?;
            return Ok(());
        }

        // Step 4: query understanding (cheap LLM call, degrades gracefully)
        let doc_info = self.session_doc_info(session)?;
        let filenames: Vec<String> = doc_info.iter().map(|(_, name)| name.clone()).collect();
        let understanding = QueryUnderstandingService::new(&self.llm)
            .understand(user_message, &filenames)
            .await?;

        // Step 5: comparison branch
        let wants_comparison = match options.force_comparison {
            Some(forced) => forced,
            None => understanding.query_type == QueryType::Comparison,
        };
        let document_ids = options
            .selected_document_ids
            .clone()
            .unwrap_or_else(|| session.document_ids.clone());

        if wants_comparison && document_ids.len() >= 2 {
            return self
                .comparison_flow(
                    session,
                    user_message,
                    &understanding,
                    &doc_info,
                    document_ids,
                    options,
                    &history,
                    tx,
                )
                .await;
        }

        // Steps 6-7: hybrid retrieval with adaptive sizing, rerank, expand
        let sizing = RetrievalSizing::resolve(
            &understanding,
            self.config.retrieval_candidates,
            options
                .num_chunks
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(self.config.final_top_k),
        );
        tracing::info!(
            session_id = %session.id,
            query_type = ?understanding.query_type,
            candidates = sizing.candidates,
            final_top_k = sizing.final_top_k,
            "adaptive retrieval sizing"
        );

        let filter = if document_ids.is_empty() {
            ChunkFilter {
                collection_id: session.collection_id.clone(),
                document_ids: None,
            }
        } else {
            ChunkFilter::documents(&document_ids)
        };

        let candidates = self.retriever.retrieve(
            &understanding.reformulated_query,
            &filter,
            sizing.candidates,
            Some(&understanding),
            self.config.semantic_similarity_floor,
        )?;

        let mut chunks = self
            .reranker
            .rerank(
                user_message,
                candidates,
                Some(&understanding),
                sizing.final_top_k,
            )
            .await?;

        if chunks.is_empty() {
            tracing::warn!(session_id = %session.id, "no relevant chunks found");
        } else {
            chunks = ContextExpander.expand(
                &self.store,
                chunks,
                self.config.expansion_rerank_floor,
                sizing.max_expansion_per_chunk,
                sizing.max_total_after_expansion,
            )?;
        }

        // Step 8: budget enforcement (chunks first, then summary, never
        // the recent messages)
        let enforcer = BudgetEnforcer::default();
        let (summary_text, chunks) = enforcer.enforce(
            user_message,
            history.summary_text.clone(),
            &history.recent_messages,
            chunks,
        );

        // Step 10: citation context for the UI
        let citation_context = if chunks.is_empty() {
            None
        } else {
            let payload = self.build_citation_context(&chunks)?;
            let _ = tx.send(ChatEvent::CitationContext(payload.clone())).await;
            Some(payload)
        };

        // Step 9: prompt assembly
        let prompt = build_prompt(
            user_message,
            summary_text.as_deref(),
            &history.recent_messages,
            &chunks,
        );

        // Steps 11-12: stream and persist
        let source_chunks: Vec<String> = chunks.iter().map(|c| c.chunk.chunk_id.clone()).collect();
        self.stream_and_persist(
            session,
            user_message,
            &prompt,
            &source_chunks,
            None,
            citation_context,
            tx,
        )
        .await
    }

    /// Comparison flow (§ comparison): selection rules, per-document
    /// retrieval, pairing/clustering, answer synthesis.
    #[allow(clippy::too_many_arguments)]
    async fn comparison_flow(
        &self,
        session: &ChatSession,
        user_message: &str,
        understanding: &QueryUnderstanding,
        doc_info: &[(String, String)],
        document_ids: Vec<String>,
        options: &ChatOptions,
        history: &LoadedHistory,
        tx: &tokio::sync::mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let max_docs = self.config.comparison_max_documents;

        // Selection rules for >3 attached documents
        let final_doc_ids = if document_ids.len() <= max_docs
            || options.selected_document_ids.is_some()
        {
            let mut ids = document_ids;
            ids.truncate(max_docs.max(2));
            ids
        } else {
            let matched = match_entities_to_documents(&understanding.entities, doc_info);
            match matched.len() {
                2..=3 => matched,
                n if n > 3 => {
                    // User named more than 3: ask for a selection among them
                    let selection = selection_event(
                        doc_info,
                        &matched,
                        &matched[..3],
                        user_message,
                        &format!(
                            "You mentioned {n} documents. Please select up to 3 to compare:"
                        ),
                    );
                    let _ = tx.send(ChatEvent::ComparisonSelection(selection)).await;
                    return Ok(());
                }
                _ => {
                    // Nothing specific named: select from all session docs
                    let all_ids: Vec<String> =
                        doc_info.iter().map(|(id, _)| id.clone()).collect();
                    let selection = selection_event(
                        doc_info,
                        &all_ids,
                        &[],
                        user_message,
                        "Select 2-3 documents to compare:",
                    );
                    let _ = tx.send(ChatEvent::ComparisonSelection(selection)).await;
                    return Ok(());
                }
            }
        };

        tracing::info!(
            session_id = %session.id,
            num_docs = final_doc_ids.len(),
            "comparison proceeding"
        );

        let comparison = ComparisonRetriever::new(
            Arc::clone(&self.store),
            self.retriever.clone(),
            self.reranker.clone(),
            self.config.final_top_k,
            self.config.comparison_similarity_threshold,
        );
        let context = comparison
            .retrieve_for_comparison(user_message, &final_doc_ids, Some(understanding))
            .await?;

        let payload = context.to_event_payload();
        let _ = tx.send(ChatEvent::ComparisonContext(payload.clone())).await;

        let prompt = build_comparison_prompt(
            user_message,
            history.summary_text.as_deref(),
            &context,
        );

        let source_chunks: Vec<String> = context
            .pairs
            .iter()
            .flat_map(|p| [p.chunk_a.chunk.chunk_id.clone(), p.chunk_b.chunk.chunk_id.clone()])
            .chain(
                context
                    .clusters
                    .iter()
                    .flat_map(|c| c.chunks.iter().map(|(_, chunk)| chunk.chunk.chunk_id.clone())),
            )
            .collect();

        self.stream_and_persist(
            session,
            user_message,
            &prompt,
            &source_chunks,
            Some(payload),
            None,
            tx,
        )
        .await
    }

    /// Streams the LLM answer, then persists the turn. A mid-stream error
    /// persists the partial response with an interruption marker.
    #[allow(clippy::too_many_arguments)]
    async fn stream_and_persist(
        &self,
        session: &ChatSession,
        user_message: &str,
        prompt: &str,
        source_chunks: &[String],
        comparison_metadata: Option<serde_json::Value>,
        citation_context: Option<serde_json::Value>,
        tx: &tokio::sync::mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        use futures_util::StreamExt;

        let mut stream = self.llm.stream_chat(prompt).await.map_err(crate::Error::from)?;
        let mut full_response = String::new();
        let mut usage: Option<TokenUsage> = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Delta(text)) => {
                    full_response.push_str(&text);
                    let _ = tx.send(ChatEvent::Token(text)).await;
                }
                Ok(StreamEvent::Usage(u)) => {
                    usage = Some(u);
                    let _ = tx.send(ChatEvent::Usage(u)).await;
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id,
                        partial_len = full_response.len(),
                        error = %e,
                        "LLM streaming failed"
                    );
                    if !full_response.is_empty() {
                        let partial = format!("{full_response}{INTERRUPTION_MARKER}");
                        self.persist_turn(
                            session,
                            user_message,
                            &partial,
                            source_chunks,
                            usage,
                            comparison_metadata,
                            citation_context,
                        )?;
                    }
                    return Err(crate::Error::from(e));
                }
            }
        }

        self.persist_turn(
            session,
            user_message,
            &full_response,
            source_chunks,
            usage,
            comparison_metadata,
            citation_context,
        )?;
        tracing::info!(
            session_id = %session.id,
            response_len = full_response.len(),
            "chat response complete"
        );
        Ok(())
    }

    /// Persists the user/assistant pair in one transaction.
    #[allow(clippy::too_many_arguments)]
    fn persist_turn(
        &self,
        session: &ChatSession,
        user_message: &str,
        assistant_message: &str,
        source_chunks: &[String],
        usage: Option<TokenUsage>,
        comparison_metadata: Option<serde_json::Value>,
        citation_context: Option<serde_json::Value>,
    ) -> Result<()> {
        let user = ChatMessage::new(&session.id, MessageRole::User, user_message);
        let mut assistant = ChatMessage::new(&session.id, MessageRole::Assistant, assistant_message);
        assistant.source_chunk_ids = source_chunks.to_vec();
        assistant.usage = usage.map(|u| serde_json::to_value(u).unwrap_or_default());
        assistant.comparison_metadata = comparison_metadata;
        assistant.citation_context = citation_context;
        with_store(&self.store, |s| s.append_chat_turn(&user, &assistant))
    }

    /// Builds the citation context payload: one entry per retrieved chunk
    /// with the 8-char ref, filename, bbox page, section, and bbox.
    fn build_citation_context(&self, chunks: &[RetrievedChunk]) -> Result<serde_json::Value> {
        let mut filenames: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        for retrieved in chunks {
            let doc_id = &retrieved.chunk.document_id;
            if !filenames.contains_key(doc_id)
                && let Some(doc) = with_store(&self.store, |s| s.get_document(doc_id))?
            {
                filenames.insert(doc_id.clone(), doc.filename);
            }
        }

        let citations: Vec<serde_json::Value> = chunks
            .iter()
            .map(|retrieved| {
                let chunk = &retrieved.chunk;
                serde_json::json!({
                    "ref": chunk.short_ref(),
                    "chunk_id": chunk.chunk_id,
                    "document_id": chunk.document_id,
                    "filename": filenames
                        .get(&chunk.document_id)
                        .cloned()
                        .unwrap_or_else(|| "Unknown".to_string()),
                    "page": chunk.citation_page(),
                    "section": chunk.section_heading,
                    "bbox": chunk.bbox,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "citations": citations,
            "document_map": filenames,
        }))
    }

    /// (id, filename) pairs for the session's documents.
    fn session_doc_info(&self, session: &ChatSession) -> Result<Vec<(String, String)>> {
        let mut info = Vec::with_capacity(session.document_ids.len());
        for doc_id in &session.document_ids {
            if let Some(doc) = with_store(&self.store, |s| s.get_document(doc_id))? {
                info.push((doc.id, doc.filename));
            }
        }
        Ok(info)
    }
}

/// Builds the `selection_needed` payload.
fn selection_event(
    doc_info: &[(String, String)],
    candidate_ids: &[String],
    pre_selected: &[String],
    original_query: &str,
    message: &str,
) -> serde_json::Value {
    let documents: Vec<serde_json::Value> = doc_info
        .iter()
        .filter(|(id, _)| candidate_ids.contains(id))
        .map(|(id, name)| serde_json::json!({ "id": id, "name": name }))
        .collect();
    serde_json::json!({
        "type": "selection_needed",
        "documents": documents,
        "pre_selected": pre_selected,
        "original_query": original_query,
        "message": message,
    })
}

/// Assembles the chat prompt: summary block, recent messages, retrieved
/// chunks with short-ref citations, then the new question.
fn build_prompt(
    user_message: &str,
    summary_text: Option<&str>,
    recent_messages: &[ChatMessage],
    chunks: &[RetrievedChunk],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(
        "You are a document analysis assistant. Answer using only the source excerpts below. \
         Reference sources by their [ref] markers. If the sources do not contain the answer, say so."
            .to_string(),
    );

    if let Some(summary) = summary_text {
        parts.push(format!("CONVERSATION SUMMARY:\n{summary}"));
    }

    if !recent_messages.is_empty() {
        let history: Vec<String> = recent_messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect();
        parts.push(format!("RECENT MESSAGES:\n{}", history.join("\n")));
    }

    if chunks.is_empty() {
        parts.push("SOURCES: none found for this question.".to_string());
    } else {
        let sources: Vec<String> = chunks
            .iter()
            .map(|retrieved| {
                format!(
                    "[{}] (p{}) {}",
                    retrieved.chunk.short_ref(),
                    retrieved.chunk.citation_page(),
                    retrieved.scoring_text()
                )
            })
            .collect();
        parts.push(format!("SOURCES:\n{}", sources.join("\n\n")));
    }

    parts.push(format!("QUESTION: {user_message}"));
    parts.join("\n\n")
}

/// Assembles the comparison prompt from pairs/clusters and unpaired
/// leftovers.
fn build_comparison_prompt(
    user_message: &str,
    summary_text: Option<&str>,
    context: &ComparisonContext,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(
        "You are a document analysis assistant comparing deal documents. Use the aligned \
         excerpts below; call out differences explicitly and reference documents by label."
            .to_string(),
    );

    if let Some(summary) = summary_text {
        parts.push(format!("CONVERSATION SUMMARY:\n{summary}"));
    }

    let labels: Vec<String> = context
        .documents
        .iter()
        .map(|d| format!("{} = {}", d.label, d.filename))
        .collect();
    parts.push(format!("DOCUMENTS:\n{}", labels.join("\n")));

    for pair in &context.pairs {
        parts.push(format!(
            "TOPIC: {}\nDocument A (p{}): {}\nDocument B (p{}): {}",
            pair.topic,
            pair.chunk_a.chunk.citation_page(),
            pair.chunk_a.chunk.text,
            pair.chunk_b.chunk.citation_page(),
            pair.chunk_b.chunk.text,
        ));
    }

    for cluster in &context.clusters {
        let mut lines = vec![format!("TOPIC: {}", cluster.topic)];
        for (index, (_, chunk)) in cluster.chunks.iter().enumerate() {
            let label = context
                .documents
                .get(index)
                .map_or_else(|| format!("Document {}", index + 1), |d| d.label.clone());
            lines.push(format!(
                "{label} (p{}): {}",
                chunk.chunk.citation_page(),
                chunk.chunk.text
            ));
        }
        parts.push(lines.join("\n"));
    }

    let leftovers: Vec<String> = context
        .unpaired
        .iter()
        .flat_map(|(doc_id, chunks)| {
            let label = context
                .documents
                .iter()
                .find(|d| &d.id == doc_id)
                .map_or_else(|| doc_id.clone(), |d| d.label.clone());
            chunks
                .iter()
                .map(move |c| format!("{label} only: {}", c.chunk.text))
        })
        .collect();
    if !leftovers.is_empty() {
        parts.push(format!("UNMATCHED CONTENT:\n{}", leftovers.join("\n")));
    }

    parts.push(format!("QUESTION: {user_message}"));
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkKind, DocChunkBuilder};

    fn retrieved(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            rowid: 0,
            chunk: DocChunkBuilder::new("d", "sec_1", 1, ChunkKind::Narrative)
                .text(text.to_string())
                .page_range(5, 5)
                .build(),
            hybrid_score: 0.5,
            semantic_score: None,
            bm25_score: None,
            rerank_score: Some(0.8),
            compressed_text: None,
            expanded: false,
        }
    }

    #[test]
    fn test_build_prompt_order() {
        let recent = vec![ChatMessage::new("s", MessageRole::User, "earlier question")];
        let prompt = build_prompt(
            "what is the noi?",
            Some("Earlier: cap rates discussed."),
            &recent,
            &[retrieved("NOI was $4.2M in 2023.")],
        );
        let summary_pos = prompt.find("CONVERSATION SUMMARY").unwrap();
        let recent_pos = prompt.find("RECENT MESSAGES").unwrap();
        let sources_pos = prompt.find("SOURCES").unwrap();
        let question_pos = prompt.find("QUESTION").unwrap();
        assert!(summary_pos < recent_pos);
        assert!(recent_pos < sources_pos);
        assert!(sources_pos < question_pos);
        assert!(prompt.contains("(p5)"));
    }

    #[test]
    fn test_build_prompt_no_chunks() {
        let prompt = build_prompt("question", None, &[], &[]);
        assert!(prompt.contains("none found"));
    }

    #[test]
    fn test_selection_event_payload() {
        let docs = vec![
            ("d1".to_string(), "a.pdf".to_string()),
            ("d2".to_string(), "b.pdf".to_string()),
            ("d3".to_string(), "c.pdf".to_string()),
        ];
        let candidates = vec!["d1".to_string(), "d3".to_string()];
        let event = selection_event(&docs, &candidates, &candidates[..1], "compare", "pick");
        assert_eq!(event["type"], "selection_needed");
        assert_eq!(event["documents"].as_array().unwrap().len(), 2);
        assert_eq!(event["pre_selected"][0], "d1");
        assert_eq!(event["original_query"], "compare");
    }

    #[test]
    fn test_sse_formats() {
        assert!(ChatEvent::Token("hi".to_string()).to_sse().starts_with("data: "));
        assert!(
            ChatEvent::ComparisonSelection(serde_json::json!({}))
                .to_sse()
                .starts_with("event: comparison_selection\n")
        );
        let end = ChatEvent::End.to_sse();
        assert!(end.starts_with("event: end\n"));
        assert!(end.ends_with("\n\n"));
    }

    #[test]
    fn test_comparison_prompt_includes_labels() {
        let context = ComparisonContext {
            documents: vec![
                DocumentLabel {
                    id: "d1".to_string(),
                    filename: "sunset.pdf".to_string(),
                    label: "Document A".to_string(),
                },
                DocumentLabel {
                    id: "d2".to_string(),
                    filename: "ocean.pdf".to_string(),
                    label: "Document B".to_string(),
                },
            ],
            pairs: vec![ChunkPair {
                chunk_a: retrieved("Cap rate 5.2%"),
                chunk_b: retrieved("Cap rate 4.8%"),
                similarity: 0.8,
                topic: "Cap Rate".to_string(),
            }],
            clusters: Vec::new(),
            unpaired: std::collections::BTreeMap::new(),
            num_documents: 2,
        };
        let prompt = build_comparison_prompt("compare cap rates", None, &context);
        assert!(prompt.contains("Document A = sunset.pdf"));
        assert!(prompt.contains("TOPIC: Cap Rate"));
        assert!(prompt.contains("compare cap rates"));
    }
}
