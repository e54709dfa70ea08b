//! End-to-end tests over the public API: ingestion, extraction chains
//! (dedup, failure, resume), workflow generation (validation, corrective
//! retry, partial salvage), and chat (low-signal, citations, comparison).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use dossier::chat::{ChatEvent, ChatOptions, ChatOrchestrator};
use dossier::config::EngineConfig;
use dossier::core::{ChatSession, ChunkKind, DocChunkBuilder, Document, MessageRole};
use dossier::embedding::{DEFAULT_DIMENSIONS, Embedder, FallbackEmbedder};
use dossier::error::LlmError;
use dossier::llm::{
    CompletionRequest, CompletionResponse, EventStream, LlmClient, LlmProvider, StreamEvent,
    TokenUsage,
};
use dossier::parse::{ParserFactory, ParserKind};
use dossier::pipeline::{PipelineEngine, ProgressEvent};
use dossier::retrieval::{HybridRetriever, Reranker};
use dossier::storage::{SharedStore, SqliteStore, shared, with_store};
use dossier::workflow::PromptRegistry;

// ==================== scripted provider ====================

/// Provider scripted by inspecting request content, so one mock serves
/// classification, summarization, extraction, memo generation, and chat
/// streaming.
struct ScriptedProvider {
    calls: AtomicU32,
    memo_attempts: AtomicU32,
    /// First memo attempt cites a document that does not exist.
    invalid_citation_first: bool,
    /// Memo citation budget (taken from the context whitelist).
    memo_citations: usize,
    /// When set, extraction calls fail (non-retryably).
    fail_extraction: AtomicBool,
    /// Query type returned by the classifier.
    classify_as: &'static str,
    /// Entities returned by the classifier.
    entities: Vec<&'static str>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            calls: AtomicU32::new(0),
            memo_attempts: AtomicU32::new(0),
            invalid_citation_first: false,
            memo_citations: 6,
            fail_extraction: AtomicBool::new(false),
            classify_as: "general_qa",
            entities: Vec::new(),
        }
    }
}

impl ScriptedProvider {
    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            prompt_tokens: 500,
            completion_tokens: 100,
            total_tokens: 600,
            cache_read_tokens: 200,
            cache_write_tokens: 0,
        }
    }

    fn respond(content: String) -> CompletionResponse {
        CompletionResponse {
            content,
            usage: Self::usage(),
            model: "gpt-5.2-2025-12-11".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    fn whitelist_tokens(text: &str) -> Vec<String> {
        let re = regex::Regex::new(r"\[D\d+:p\d+\]").unwrap();
        let mut seen = std::collections::BTreeSet::new();
        re.find_iter(text)
            .map(|m| m.as_str().to_string())
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    fn memo_json(&self, user_message: &str, attempt: u32) -> String {
        let mut tokens = Self::whitelist_tokens(user_message);
        if tokens.is_empty() {
            tokens.push("[D1:p1]".to_string());
        }
        tokens.truncate(self.memo_citations);
        if self.invalid_citation_first && attempt == 0 {
            tokens = vec!["[D3:p1]".to_string()];
        }

        let sections: Vec<serde_json::Value> = dossier::workflow::MEMO_REQUIRED_SECTIONS
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let citation = &tokens[i % tokens.len()];
                serde_json::json!({
                    "key": key,
                    "title": key,
                    "content": format!("Analysis for {key} {citation}."),
                    "citations": [citation],
                    "confidence": 0.9
                })
            })
            .collect();

        serde_json::json!({
            "currency": "USD",
            "sections": sections,
            "financials": {
                "currency": "USD",
                "historical": [{"year": 2023, "revenue": 111_900_000.0, "citation": tokens[0]}]
            },
            "risks": [{
                "description": "Customer concentration",
                "category": "Commercial",
                "severity": "High",
                "citations": [tokens[0]]
            }],
            "opportunities": [{
                "description": "Geographic expansion",
                "category": "Growth",
                "impact": "Medium",
                "citations": [tokens[0]]
            }],
            "next_steps": [{"priority": 1, "action": "Management interviews", "owner": "Investor"}],
            "inconsistencies": [],
            "references": tokens,
            "meta": {"version": 2}
        })
        .to_string()
    }

    fn classification(&self) -> String {
        serde_json::json!({
            "query_type": self.classify_as,
            "reformulated_query": "cap rate comparison",
            "entities": self.entities,
            "confidence": 0.9,
            "hypothetical_answer": null
        })
        .to_string()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let system = request
            .messages
            .first()
            .filter(|m| matches!(m.role, dossier::llm::Role::System))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        // Structured memo generation (schema-enforced surface)
        if request.response_schema.is_some() {
            let attempt = self.memo_attempts.fetch_add(1, Ordering::SeqCst);
            return Ok(Self::respond(self.memo_json(&user, attempt)));
        }

        // One-shot structured extraction
        if system.contains("extract structured deal facts") {
            if self.fail_extraction.load(Ordering::SeqCst) {
                return Err(LlmError::ApiRequest {
                    message: "invalid request".to_string(),
                    status: Some(400),
                });
            }
            return Ok(Self::respond(
                serde_json::json!({
                    "company_info": {"company_name": "NPC International"},
                    "financials": {"revenue_by_year": {"2023": 111_900_000.0}},
                    "key_risks": [{"risk": "Customer concentration", "severity": "High"}]
                })
                .to_string(),
            ));
        }

        // Query understanding
        if user.contains("Classify this document-analysis query") {
            return Ok(Self::respond(self.classification()));
        }

        // Conversation summarization
        if user.contains("Summarize this conversation") {
            return Ok(Self::respond(
                serde_json::json!({"summary": "Earlier discussion.", "key_facts": []}).to_string(),
            ));
        }

        // Map-phase and document summaries (plain text)
        Ok(Self::respond("Summary of the excerpts.".to_string()))
    }

    async fn stream(&self, _request: &CompletionRequest) -> Result<EventStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let events = vec![
            Ok(StreamEvent::Delta("The cap rates differ ".to_string())),
            Ok(StreamEvent::Delta("across the deals.".to_string())),
            Ok(StreamEvent::Usage(Self::usage())),
        ];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

// ==================== fixtures ====================

struct Fixture {
    _tmp: tempfile::TempDir,
    config: EngineConfig,
    store: SharedStore,
    engine: Arc<PipelineEngine>,
    provider: Arc<ScriptedProvider>,
    llm: Arc<LlmClient>,
    embedder: Arc<dyn Embedder>,
}

fn fixture_with(provider: ScriptedProvider) -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = EngineConfig::builder()
        .api_key("test")
        .data_dir(tmp.path())
        .build()
        .unwrap();

    let mut sqlite = SqliteStore::open(config.db_path()).unwrap();
    sqlite.init().unwrap();
    let store = shared(sqlite);

    let provider = Arc::new(provider);
    let llm = Arc::new(LlmClient::new(
        Arc::clone(&provider) as Arc<dyn LlmProvider>,
        &config,
    ));
    let embedder: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(DEFAULT_DIMENSIONS));

    let engine = PipelineEngine::start(
        Arc::clone(&store),
        Arc::new(dossier::storage::FsArtifactStore::new(config.artifact_root())),
        Arc::clone(&llm),
        Arc::clone(&embedder),
        ParserFactory::with_builtin(),
        PromptRegistry::with_builtin(),
        config.clone(),
        None,
    );

    Fixture {
        _tmp: tmp,
        config,
        store,
        engine,
        provider,
        llm,
        embedder,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedProvider::default())
}

fn write_doc(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const SAMPLE_DOC: &str = "\
# Executive Overview

Sunset Plaza is a mixed-use asset with strong recurring income and durable tenancy.

# Financial Performance

Revenue grew to $12M in 2023 with ebitda margin expansion and profitability gains.

# Risks

Customer concentration and regulatory risk factors remain the key concerns.
";

/// Waits for a job to reach a terminal event.
async fn await_job(engine: &PipelineEngine, job_id: &str) -> ProgressEvent {
    let (snapshot, mut rx) = engine.subscribe(job_id).unwrap();
    if snapshot.is_terminal() {
        return snapshot;
    }
    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.is_terminal() => return event,
                Ok(_) => {}
                Err(_) => {
                    // Channel closed after end; re-read the snapshot
                    return ProgressEvent::End {
                        job_id: String::new(),
                    };
                }
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Ingests documents directly into the store. Each text becomes its own
/// section on its own page under a "Cap Rate" heading.
fn seed_documents(fixture: &Fixture, names_and_texts: &[(&str, &[&str])]) -> Vec<String> {
    let mut ids = Vec::new();
    for (name, texts) in names_and_texts {
        let doc = Document::new("u1", "org1", name, name.as_bytes());
        with_store(&fixture.store, |s| s.insert_document(&doc)).unwrap();

        let chunks: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                #[allow(clippy::cast_possible_truncation)]
                let page = i as u32 + 1;
                DocChunkBuilder::new(&doc.id, &format!("sec_{i}"), 1, ChunkKind::Narrative)
                    .text((*text).to_string())
                    .page_range(page, page)
                    .section_heading(Some("Cap Rate".to_string()))
                    .build()
            })
            .collect();
        let rowids = with_store(&fixture.store, |s| s.add_chunks(&chunks)).unwrap();
        let embeddings: Vec<(i64, Vec<f32>)> = chunks
            .iter()
            .zip(&rowids)
            .map(|(chunk, rowid)| (*rowid, fixture.embedder.embed(&chunk.text).unwrap()))
            .collect();
        with_store(&fixture.store, |s| s.store_embeddings_batch(&embeddings, None)).unwrap();
        ids.push(doc.id);
    }
    ids
}

// ==================== ingestion & extraction ====================

#[tokio::test]
async fn ingest_then_search_roundtrip() {
    let fixture = fixture();
    let path = write_doc(fixture._tmp.path(), "deal.txt", SAMPLE_DOC);

    let (document, job_id) = fixture
        .engine
        .ingest_document(&path, "u1", "org1", ParserKind::Plain)
        .unwrap();
    let outcome = await_job(&fixture.engine, &job_id.unwrap()).await;
    assert!(matches!(outcome, ProgressEvent::Complete { .. }));

    let loaded = with_store(&fixture.store, |s| s.get_document(&document.id))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.status, dossier::DocumentStatus::Completed);
    assert!(with_store(&fixture.store, |s| s.chunk_count(&document.id)).unwrap() > 0);

    // Retrieve by query, then by document filter: same chunks appear
    let retriever = HybridRetriever::new(
        Arc::clone(&fixture.store),
        Arc::clone(&fixture.embedder),
    );
    let by_query = retriever
        .retrieve("revenue ebitda", &dossier::ChunkFilter::default(), 10, None, 0.0)
        .unwrap();
    assert!(!by_query.is_empty());
    let by_doc = retriever
        .retrieve(
            "revenue ebitda",
            &dossier::ChunkFilter::document(&document.id),
            10,
            None,
            0.0,
        )
        .unwrap();
    let ids_query: std::collections::HashSet<_> =
        by_query.iter().map(|r| r.chunk.chunk_id.clone()).collect();
    let ids_doc: std::collections::HashSet<_> =
        by_doc.iter().map(|r| r.chunk.chunk_id.clone()).collect();
    assert_eq!(ids_query, ids_doc);
}

#[tokio::test]
async fn duplicate_upload_returns_existing_document() {
    let fixture = fixture();
    let path = write_doc(fixture._tmp.path(), "deal.txt", SAMPLE_DOC);

    let (first, job) = fixture
        .engine
        .ingest_document(&path, "u1", "org1", ParserKind::Plain)
        .unwrap();
    await_job(&fixture.engine, &job.unwrap()).await;

    let (second, job) = fixture
        .engine
        .ingest_document(&path, "u2", "org1", ParserKind::Plain)
        .unwrap();
    assert_eq!(second.id, first.id);
    assert!(job.is_none());
}

#[tokio::test]
async fn extraction_chain_completes_and_dedups_by_history() {
    let fixture = fixture();
    let path = write_doc(fixture._tmp.path(), "deal.txt", SAMPLE_DOC);

    let submission = fixture
        .engine
        .submit_extraction(&path, "u1", "org1", None, ParserKind::Plain)
        .unwrap();
    let outcome = await_job(&fixture.engine, &submission.job_id.unwrap()).await;
    assert!(matches!(outcome, ProgressEvent::Complete { .. }));

    let record = with_store(&fixture.store, |s| s.get_extraction(&submission.record.id))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, dossier::core::ExtractionStatus::Completed);
    assert!(record.artifact.is_some());
    assert!(record.token_usage.unwrap() > 0);

    // Second upload of identical content: served from history, no new run
    let again = fixture
        .engine
        .submit_extraction(&path, "u1", "org1", None, ParserKind::Plain)
        .unwrap();
    assert!(again.record.from_history);
    assert!(again.job_id.is_none());
    assert!(again.record.artifact.is_some());
}

#[tokio::test]
async fn concurrent_extraction_guard_rejects_second_submission() {
    let fixture = fixture();
    // Park an active extraction directly in the store
    let record = dossier::ExtractionRecord::new("doc-x", "hash-x", "u1", "org1", None);
    with_store(&fixture.store, |s| s.insert_extraction(&record)).unwrap();

    let path = write_doc(fixture._tmp.path(), "other.txt", SAMPLE_DOC);
    let err = fixture
        .engine
        .submit_extraction(&path, "u1", "org1", None, ParserKind::Plain)
        .unwrap_err();
    assert!(err.to_string().contains("already has an active extraction"));
}

#[tokio::test]
async fn failed_extraction_resumes_from_summaries() {
    // Needs a document big enough to run the summarization pass
    let fixture = fixture();
    let big_doc = format!(
        "# Overview\n\n{}",
        "Revenue detail sentence for the record. ".repeat(4000)
    );
    let path = write_doc(fixture._tmp.path(), "big.txt", &big_doc);

    fixture.provider.fail_extraction.store(true, Ordering::SeqCst);
    let submission = fixture
        .engine
        .submit_extraction(&path, "u1", "org1", None, ParserKind::Plain)
        .unwrap();
    let job_id = submission.job_id.unwrap();
    let outcome = await_job(&fixture.engine, &job_id).await;
    match outcome {
        ProgressEvent::Error { stage, .. } => {
            assert_eq!(stage.as_deref(), Some("extract_structured"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Summarization completed before the failure: resume is allowed
    let job = with_store(&fixture.store, |s| s.get_job(&job_id)).unwrap().unwrap();
    assert!(job.stage_complete("summarizing"));
    assert!(job.intermediate_artifacts.contains_key("summarizing"));

    fixture.provider.fail_extraction.store(false, Ordering::SeqCst);
    let retry_job = fixture.engine.retry_extraction(&submission.record.id).unwrap();
    let outcome = await_job(&fixture.engine, &retry_job).await;
    assert!(matches!(outcome, ProgressEvent::Complete { .. }));

    let record = with_store(&fixture.store, |s| s.get_extraction(&submission.record.id))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, dossier::core::ExtractionStatus::Completed);
}

// ==================== workflow ====================

async fn run_memo_workflow(fixture: &Fixture, doc_ids: Vec<String>) -> dossier::WorkflowRun {
    let (run, job_id) = fixture
        .engine
        .submit_workflow_run(
            "Investment Memo",
            doc_ids,
            serde_json::json!({
                "company_name": "Sunset Plaza",
                "target_audience": "Investment Committee"
            }),
            None,
        )
        .unwrap();
    await_job(&fixture.engine, &job_id).await;
    with_store(&fixture.store, |s| s.get_run(&run.id)).unwrap().unwrap()
}

#[tokio::test]
async fn workflow_completes_with_citation_density_warning() {
    let mut provider = ScriptedProvider::default();
    provider.memo_citations = 3; // below the 2-doc adaptive minimum of 4
    let fixture = fixture_with(provider);
    let doc_ids = seed_documents(
        &fixture,
        &[
            (
                "sunset.pdf",
                &[
                    "The cap rate is 5.2 percent with revenue growth of 12 percent.",
                    "Investment highlights include durable recurring revenue.",
                    "Risk factors include customer concentration in the region.",
                    "Market size grew with strong competition dynamics.",
                ],
            ),
            (
                "ocean.pdf",
                &[
                    "The cap rate is 4.8 percent with ebitda margin of 40 percent.",
                    "Business overview shows profitability and financial performance.",
                    "Regulatory risk and operational risk remain moderate.",
                    "Recommended actions cover follow-up diligence next steps.",
                ],
            ),
        ],
    );

    let run = run_memo_workflow(&fixture, doc_ids).await;
    assert_eq!(run.status, dossier::core::RunStatus::Completed);
    assert_eq!(run.attempts, 1);
    let warnings = run.validation_errors.unwrap()["warnings"].clone();
    let warning_codes: Vec<String> = warnings
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["code"].as_str().unwrap().to_string())
        .collect();
    assert!(warning_codes.contains(&"citation_count_warning".to_string()));
    assert_eq!(run.currency.as_deref(), Some("USD"));
}

#[tokio::test]
async fn unknown_citation_triggers_corrective_retry() {
    let mut provider = ScriptedProvider::default();
    provider.invalid_citation_first = true;
    let fixture = fixture_with(provider);
    let doc_ids = seed_documents(
        &fixture,
        &[
            (
                "a.pdf",
                &[
                    "Cap rate 5.2 percent, revenue growth strong in 2023.",
                    "Investment highlights and key strengths of the business overview.",
                    "Risk factors include regulatory risk in two states.",
                ],
            ),
            (
                "b.pdf",
                &[
                    "Cap rate 4.8 percent, revenue growth modest in 2023.",
                    "Financial performance with ebitda margin expansion and profitability.",
                    "Recommended actions and follow-up diligence next steps.",
                ],
            ),
        ],
    );

    let run = run_memo_workflow(&fixture, doc_ids).await;
    assert_eq!(run.status, dossier::core::RunStatus::Completed);
    assert_eq!(run.attempts, 2);
    assert!(run.citations_count > 0);
}

#[tokio::test]
async fn workflow_with_unindexed_documents_fails_non_retryably() {
    let fixture = fixture();
    // Documents exist but have no chunks
    let doc = Document::new("u1", "org1", "empty.pdf", b"no chunks");
    with_store(&fixture.store, |s| s.insert_document(&doc)).unwrap();

    let (run, job_id) = fixture
        .engine
        .submit_workflow_run(
            "Investment Memo",
            vec![doc.id],
            serde_json::json!({"company_name": "X", "target_audience": "Deal Team"}),
            None,
        )
        .unwrap();
    let outcome = await_job(&fixture.engine, &job_id).await;
    match outcome {
        ProgressEvent::Error { error_type, retryable, .. } => {
            assert_eq!(error_type, dossier::error::StageErrorKind::RetrievalError);
            assert!(!retryable);
        }
        other => panic!("expected error, got {other:?}"),
    }

    let run = with_store(&fixture.store, |s| s.get_run(&run.id)).unwrap().unwrap();
    assert_eq!(run.status, dossier::core::RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("no chunks retrieved"));
}

#[tokio::test]
async fn workflow_document_count_enforced() {
    let fixture = fixture();
    let err = fixture
        .engine
        .submit_workflow_run("Investment Memo", Vec::new(), serde_json::json!({}), None)
        .unwrap_err();
    assert!(err.to_string().contains("outside allowed range"));
}

// ==================== chat ====================

fn orchestrator(fixture: &Fixture) -> ChatOrchestrator {
    ChatOrchestrator::new(
        Arc::clone(&fixture.store),
        Arc::clone(&fixture.llm),
        HybridRetriever::new(Arc::clone(&fixture.store), Arc::clone(&fixture.embedder)),
        Reranker::default(),
        fixture.config.clone(),
    )
}

fn make_session(fixture: &Fixture, doc_ids: &[String]) -> ChatSession {
    let mut session = ChatSession::new("u1", "org1", None);
    session.document_ids = doc_ids.to_vec();
    with_store(&fixture.store, |s| s.insert_session(&session)).unwrap();
    session
}

async fn collect_events(
    orchestrator: &ChatOrchestrator,
    session_id: &str,
    message: &str,
    options: ChatOptions,
) -> Vec<ChatEvent> {
    orchestrator
        .chat(session_id, message, options)
        .await
        .unwrap()
        .collect()
        .await
}

#[tokio::test]
async fn empty_message_rejected() {
    let fixture = fixture();
    let session = make_session(&fixture, &[]);
    let err = orchestrator(&fixture)
        .chat(&session.id, "   ", ChatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "chat error: User message cannot be empty");
}

#[tokio::test]
async fn low_signal_message_short_circuits() {
    let fixture = fixture();
    let session = make_session(&fixture, &[]);

    let events = collect_events(&orchestrator(&fixture), &session.id, "ok", ChatOptions::default()).await;

    // Canned token + end; no LLM call, no retrieval
    assert!(matches!(&events[0], ChatEvent::Token(t) if t.starts_with("Okay.")));
    assert!(matches!(events.last(), Some(ChatEvent::End)));
    assert_eq!(fixture.provider.call_count(), 0);

    let messages = with_store(&fixture.store, |s| s.get_messages(&session.id)).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[1].source_chunk_ids.is_empty());
}

#[tokio::test]
async fn chat_grounds_answer_with_citation_context() {
    let fixture = fixture();
    let doc_ids = seed_documents(
        &fixture,
        &[("tower.pdf", &["The cap rate for Highland Tower is 6.1 percent."][..])],
    );
    // Re-page the chunk to page 5 to exercise the bbox-page preference
    with_store(&fixture.store, |s| {
        let rows = s.chunks_for_document(&doc_ids[0]).unwrap();
        assert_eq!(rows[0].chunk.page_number, 1);
        Ok(())
    })
    .unwrap();

    let session = make_session(&fixture, &doc_ids);
    let events = collect_events(
        &orchestrator(&fixture),
        &session.id,
        "what is the cap rate of highland tower",
        ChatOptions::default(),
    )
    .await;

    let citation_context = events.iter().find_map(|e| match e {
        ChatEvent::CitationContext(payload) => Some(payload.clone()),
        _ => None,
    });
    let payload = citation_context.expect("citation context emitted");
    let citation = &payload["citations"][0];
    assert_eq!(citation["filename"], "tower.pdf");
    // ref is the first 8 chars of the chunk id
    let chunk_id = citation["chunk_id"].as_str().unwrap();
    assert_eq!(citation["ref"].as_str().unwrap(), &chunk_id[..8]);

    // Tokens streamed, usage delivered, turn persisted
    assert!(events.iter().any(|e| matches!(e, ChatEvent::Token(_))));
    assert!(events.iter().any(|e| matches!(e, ChatEvent::Usage(_))));
    let messages = with_store(&fixture.store, |s| s.get_messages(&session.id)).unwrap();
    assert_eq!(messages.len(), 2);
    assert!(!messages[1].source_chunk_ids.is_empty());
    assert!(messages[1].citation_context.is_some());
}

#[tokio::test]
async fn comparison_with_named_documents_proceeds_without_selection() {
    // Session has 5 documents; the user names three. The matcher maps all
    // three, comparison proceeds directly, and clusters are emitted.
    let mut provider = ScriptedProvider::default();
    provider.classify_as = "comparison";
    provider.entities = vec!["Sunset Plaza", "Ocean View", "Highland Tower"];
    let fixture = fixture_with(provider);

    let doc_ids = seed_documents(
        &fixture,
        &[
            ("Sunset_Plaza_OM.pdf", &["The cap rate of the property is 5.2 percent this year."][..]),
            ("Ocean_View_Deck.pdf", &["The cap rate of the property is 4.8 percent this year."][..]),
            ("Highland_Tower_CIM.pdf", &["The cap rate of the property is 6.1 percent this year."][..]),
            ("misc_notes.pdf", &["Unrelated operating notes for the quarter."][..]),
            ("other_memo.pdf", &["Unrelated leasing commentary for the site."][..]),
        ],
    );
    let session = make_session(&fixture, &doc_ids);

    let events = collect_events(
        &orchestrator(&fixture),
        &session.id,
        "Compare the cap rates of the Sunset Plaza, Ocean View, and Highland Tower deals.",
        ChatOptions::default(),
    )
    .await;

    // No selection round-trip needed
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::ComparisonSelection(_))));

    let comparison = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ComparisonContext(payload) => Some(payload.clone()),
            _ => None,
        })
        .expect("comparison context emitted");
    assert_eq!(comparison["num_documents"], 3);
    let clusters = comparison["clusters"].as_array().unwrap();
    assert!(!clusters.is_empty());
    assert_eq!(clusters[0]["topic"], "Cap Rate");

    // Answer streamed and persisted with comparison metadata
    assert!(matches!(events.last(), Some(ChatEvent::End)));
    let messages = with_store(&fixture.store, |s| s.get_messages(&session.id)).unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].comparison_metadata.is_some());
}

#[tokio::test]
async fn comparison_with_unnamed_documents_requests_selection() {
    let mut provider = ScriptedProvider::default();
    provider.classify_as = "comparison";
    let fixture = fixture_with(provider);

    let doc_ids = seed_documents(
        &fixture,
        &[
            ("a.pdf", &["Cap rate 5.2 percent."][..]),
            ("b.pdf", &["Cap rate 4.8 percent."][..]),
            ("c.pdf", &["Cap rate 6.1 percent."][..]),
            ("d.pdf", &["Cap rate 7.0 percent."][..]),
        ],
    );
    let session = make_session(&fixture, &doc_ids);

    let events = collect_events(
        &orchestrator(&fixture),
        &session.id,
        "compare these deals for me",
        ChatOptions::default(),
    )
    .await;

    let selection = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ComparisonSelection(payload) => Some(payload.clone()),
            _ => None,
        })
        .expect("selection event emitted");
    assert_eq!(selection["type"], "selection_needed");
    assert_eq!(selection["documents"].as_array().unwrap().len(), 4);
    assert!(selection["pre_selected"].as_array().unwrap().is_empty());

    // No answer persisted; the client must respond with a selection
    let messages = with_store(&fixture.store, |s| s.get_messages(&session.id)).unwrap();
    assert!(messages.is_empty());

    // Client selection round-trip resumes the comparison
    let events = collect_events(
        &orchestrator(&fixture),
        &session.id,
        "compare these deals for me",
        ChatOptions {
            force_comparison: Some(true),
            selected_document_ids: Some(doc_ids[..2].to_vec()),
            ..ChatOptions::default()
        },
    )
    .await;
    assert!(events.iter().any(|e| matches!(e, ChatEvent::ComparisonContext(_))));
}

// ==================== artifact round-trip ====================

#[test]
fn artifact_pointer_roundtrip_is_byte_identical() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = dossier::storage::FsArtifactStore::new(tmp.path());
    use dossier::storage::ArtifactStore;

    let payload = br#"{"parsed": {"sections": []}}"#;
    let pointer = store.store("runs/x/artifact.json", payload, "application/json").unwrap();
    let loaded = store.load(&pointer).unwrap();
    let pointer2 = store.store("runs/x/artifact2.json", &loaded, "application/json").unwrap();
    assert_eq!(store.load(&pointer2).unwrap(), payload);
}
