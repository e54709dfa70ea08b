//! Pipeline engine: stage implementations and job submission.
//!
//! Stage catalog:
//! - Extraction: `parse → chunk → summarize → extract_structured → store_result`
//! - Ingestion: `parse → chunk` (same stages, shorter chain)
//! - Workflow: `prepare_context → generate_artifact`
//! - Template fill: `analyze_template → detect_fields → auto_map →
//!   (await_user_review) → fill`
//!
//! Every stage is idempotent: it consumes a payload, writes its output to
//! the parent entity and the job state, and returns the augmented payload
//! with the next stage to enqueue. Stages share no memory; everything
//! flows through the payload and persisted intermediate artifacts, which
//! is what makes retry and resume trivial.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use super::broker::{StageExecutor, StageResult, TaskBroker, TaskEnvelope};
use super::events::{ProgressBus, ProgressEvent};
use super::tracker::JobTracker;
use crate::chunking::SectionChunker;
use crate::config::EngineConfig;
use crate::core::{
    ArtifactPointer, Document, DocumentStatus, ExtractionRecord, ExtractionStatus, JobParent,
    JobState, RunStatus, WorkflowRun, WorkflowTemplate, current_timestamp,
};
use crate::embedding::Embedder;
use crate::error::{Error, PipelineError, Result, StorageError};
use crate::llm::LlmClient;
use crate::parse::{ParserFactory, ParserKind, ParserOutput};
use crate::retrieval::{HybridRetriever, Reranker};
use crate::storage::{ArtifactStore, SharedStore, store_json, with_store};
use crate::workflow::{
    ContextBuilder, Generator, PreparedContext, PromptRegistry, investment_memo_template,
    red_flags_template,
};

/// Character threshold above which the summarize stage runs a cheap-model
/// summarization pass.
const SUMMARIZE_THRESHOLD_CHARS: usize = 120_000;

/// Narrative chunks included in the summarization pass.
const SUMMARIZE_CHUNK_LIMIT: usize = 50;

/// System prompt for one-shot structured extraction.
const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract structured deal facts from business documents.
Return STRICT JSON with these top-level keys where present in the source:
company_info {company_name, industry, headquarters, website, business_structure},
transaction_details {asking_price, auction_process, seller_motivation, post_sale_involvement},
financials {revenue_by_year, ebitda_by_year, net_income_by_year, gross_margin_by_year},
key_risks [{risk, description, severity}],
management_team [{name, title, background}],
investment_thesis, extraction_notes.
Numbers are raw (no unit suffixes). Omit unknown fields; never invent values."#;

/// External collaborator interface for the Excel template-fill subsystem.
///
/// The core drives the stage chain and owns the run/job records; the
/// Excel internals (sheet analysis, field detection, cell mapping,
/// writing) live behind this trait.
pub trait TemplateFillOps: Send + Sync {
    /// Analyzes the template workbook structure.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be read.
    fn analyze(&self, fill_run_id: &str) -> Result<serde_json::Value>;

    /// Detects fillable fields from the analysis.
    ///
    /// # Errors
    ///
    /// Returns an error if detection fails.
    fn detect_fields(&self, fill_run_id: &str, analysis: &serde_json::Value)
    -> Result<serde_json::Value>;

    /// Proposes a field-to-source mapping for user review.
    ///
    /// # Errors
    ///
    /// Returns an error if mapping fails.
    fn auto_map(&self, fill_run_id: &str, fields: &serde_json::Value)
    -> Result<serde_json::Value>;

    /// Fills the template from the reviewed mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if filling fails.
    fn fill(&self, fill_run_id: &str, mapping: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Result of an extraction submission.
#[derive(Debug, Clone)]
pub struct ExtractionSubmission {
    /// The extraction record (possibly already completed from history).
    pub record: ExtractionRecord,
    /// Job id when a chain was enqueued; `None` for history/cache hits.
    pub job_id: Option<String>,
}

/// The pipeline engine: owns the singletons and executes stages.
pub struct PipelineEngine {
    store: SharedStore,
    artifacts: Arc<dyn ArtifactStore>,
    llm: Arc<LlmClient>,
    embedder: Arc<dyn Embedder>,
    parsers: ParserFactory,
    chunker: SectionChunker,
    retriever: HybridRetriever,
    reranker: Reranker,
    registry: PromptRegistry,
    bus: Arc<ProgressBus>,
    config: EngineConfig,
    template_fill: Option<Arc<dyn TemplateFillOps>>,
    broker: OnceLock<TaskBroker>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine").finish()
    }
}

impl PipelineEngine {
    /// Constructs the engine and starts its broker.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        store: SharedStore,
        artifacts: Arc<dyn ArtifactStore>,
        llm: Arc<LlmClient>,
        embedder: Arc<dyn Embedder>,
        parsers: ParserFactory,
        registry: PromptRegistry,
        config: EngineConfig,
        template_fill: Option<Arc<dyn TemplateFillOps>>,
    ) -> Arc<Self> {
        let retriever = HybridRetriever::new(Arc::clone(&store), Arc::clone(&embedder));
        let engine = Arc::new(Self {
            store,
            artifacts,
            llm,
            embedder,
            parsers,
            chunker: SectionChunker::default(),
            retriever,
            reranker: Reranker::default(),
            registry,
            bus: Arc::new(ProgressBus::new()),
            config: config.clone(),
            template_fill,
            broker: OnceLock::new(),
        });

        let broker = TaskBroker::start(
            Arc::clone(&engine) as Arc<dyn StageExecutor>,
            config.worker_concurrency,
        );
        let _ = engine.broker.set(broker);
        engine
    }

    /// The progress bus for streaming subscribers.
    #[must_use]
    pub fn bus(&self) -> Arc<ProgressBus> {
        Arc::clone(&self.bus)
    }

    /// Subscribes to a job's progress stream: the current snapshot first,
    /// then live events.
    ///
    /// # Errors
    ///
    /// Returns an error when the job does not exist.
    pub fn subscribe(
        &self,
        job_id: &str,
    ) -> Result<(ProgressEvent, tokio::sync::broadcast::Receiver<ProgressEvent>)> {
        // Subscribe before reading the snapshot so no event can fall into
        // the gap; replaying a duplicate is fine, missing a terminal is not
        let receiver = self.bus.subscribe(job_id);
        let job = with_store(&self.store, |s| s.get_job(job_id))?
            .ok_or_else(|| StorageError::JobNotFound {
                id: job_id.to_string(),
            })?;
        Ok((ProgressEvent::snapshot(&job), receiver))
    }

    fn enqueue(&self, stage: &str, payload: serde_json::Value) -> Result<()> {
        self.broker
            .get()
            .ok_or(PipelineError::BrokerStopped)?
            .enqueue(TaskEnvelope::new(stage, payload))
    }

    fn tracker(&self, job_id: &str) -> JobTracker {
        JobTracker::new(Arc::clone(&self.store), Arc::clone(&self.bus), job_id)
    }

    // ==================== Submission ====================

    /// Ingests a document (parse → chunk → embed) without extraction.
    ///
    /// Duplicate uploads (same org + content hash) return the existing
    /// document without enqueuing a new run.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or storage fails.
    pub fn ingest_document(
        &self,
        path: &std::path::Path,
        user_id: &str,
        org_id: &str,
        parser: ParserKind,
    ) -> Result<(Document, Option<String>)> {
        let bytes = crate::io::read_to_bytes(path)?;
        let document = Document::new(user_id, org_id, &path_filename(path), &bytes);

        if let Some(existing) =
            with_store(&self.store, |s| s.find_document_by_hash(org_id, &document.content_hash))?
        {
            tracing::info!(document_id = %existing.id, "duplicate upload, returning existing document");
            return Ok((existing, None));
        }

        with_store(&self.store, |s| s.insert_document(&document))?;

        let job = JobState::new(JobParent::Document(document.id.clone()));
        with_store(&self.store, |s| s.insert_job(&job))?;

        self.enqueue(
            "parse",
            serde_json::json!({
                "chain": "ingest",
                "job_id": job.id,
                "document_id": document.id,
                "file_path": path.to_string_lossy(),
                "parser": parser.as_str(),
            }),
        )?;

        Ok((document, Some(job.id)))
    }

    /// Submits a one-shot structured extraction.
    ///
    /// Duplicate-by-content-hash short-circuits before enqueue: a prior
    /// completed extraction of the same bytes is returned with
    /// `from_history: true` (or `from_cache` for dedup-cache hits), and no
    /// pipeline run starts. A user may not have two concurrent
    /// extractions.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExtractionInFlight`] on the concurrency
    /// guard, or other storage errors.
    pub fn submit_extraction(
        &self,
        path: &std::path::Path,
        user_id: &str,
        org_id: &str,
        context: Option<String>,
        parser: ParserKind,
    ) -> Result<ExtractionSubmission> {
        let bytes = crate::io::read_to_bytes(path)?;
        let content_hash = crate::core::content_hash(&bytes);

        // History: a completed extraction of identical content
        if let Some(prior) =
            with_store(&self.store, |s| s.find_completed_extraction_by_hash(&content_hash))?
        {
            tracing::info!(extraction_id = %prior.id, "extraction served from history");
            let mut record = prior;
            record.from_history = true;
            return Ok(ExtractionSubmission {
                record,
                job_id: None,
            });
        }

        // Dedup cache: artifact pointer cached by content hash
        if let Some(cached) = with_store(&self.store, |s| s.cache_get(&content_hash))?
            && let Ok(pointer) = serde_json::from_value::<ArtifactPointer>(cached)
        {
            tracing::info!(%content_hash, "extraction served from cache");
            let mut record =
                ExtractionRecord::new("cached", &content_hash, user_id, org_id, context);
            record.status = ExtractionStatus::Completed;
            record.artifact = Some(pointer);
            record.from_cache = true;
            return Ok(ExtractionSubmission {
                record,
                job_id: None,
            });
        }

        // Reuse or create the document record
        let document = match with_store(&self.store, |s| {
            s.find_document_by_hash(org_id, &content_hash)
        })? {
            Some(existing) => existing,
            None => {
                let doc = Document::new(user_id, org_id, &path_filename(path), &bytes);
                with_store(&self.store, |s| s.insert_document(&doc))?;
                doc
            }
        };

        let record =
            ExtractionRecord::new(&document.id, &content_hash, user_id, org_id, context.clone());
        // The store enforces the one-active-extraction-per-user guard
        with_store(&self.store, |s| s.insert_extraction(&record))?;

        let job = JobState::new(JobParent::Extraction(record.id.clone()));
        with_store(&self.store, |s| s.insert_job(&job))?;

        self.enqueue(
            "parse",
            serde_json::json!({
                "chain": "extract",
                "job_id": job.id,
                "extraction_id": record.id,
                "document_id": document.id,
                "file_path": path.to_string_lossy(),
                "parser": parser.as_str(),
                "context": context,
            }),
        )?;

        Ok(ExtractionSubmission {
            record,
            job_id: Some(job.id),
        })
    }

    /// Submits a workflow run over already-ingested documents.
    ///
    /// # Errors
    ///
    /// Returns an error when the template is unknown, the document count
    /// is out of range, or the template has no registered prompt generator.
    pub fn submit_workflow_run(
        &self,
        template_name: &str,
        document_ids: Vec<String>,
        variables: serde_json::Value,
        custom_prompt: Option<String>,
    ) -> Result<(WorkflowRun, String)> {
        let template = self.load_template(template_name)?;

        if document_ids.len() < template.min_documents
            || document_ids.len() > template.max_documents
        {
            return Err(crate::error::WorkflowError::DocumentCount {
                got: document_ids.len(),
                min: template.min_documents,
                max: template.max_documents,
            }
            .into());
        }

        // Discover configuration faults at submission, not mid-run
        self.registry.resolve(&template.name)?;

        let mut run = WorkflowRun::new(&template, document_ids, variables, custom_prompt);
        run.status = RunStatus::Processing;
        with_store(&self.store, |s| s.insert_run(&run))?;

        let job = JobState::new(JobParent::WorkflowRun(run.id.clone()));
        with_store(&self.store, |s| s.insert_job(&job))?;

        self.enqueue(
            "prepare_context",
            serde_json::json!({
                "chain": "workflow",
                "job_id": job.id,
                "run_id": run.id,
            }),
        )?;

        Ok((run, job.id))
    }

    /// Starts a template-fill chain.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no [`TemplateFillOps`] is wired.
    pub fn submit_template_fill(&self, fill_run_id: &str) -> Result<String> {
        if self.template_fill.is_none() {
            return Err(Error::Config {
                message: "no template-fill backend configured".to_string(),
            });
        }
        let job = JobState::new(JobParent::TemplateFillRun(fill_run_id.to_string()));
        with_store(&self.store, |s| s.insert_job(&job))?;

        self.enqueue(
            "analyze_template",
            serde_json::json!({
                "chain": "template_fill",
                "job_id": job.id,
                "fill_run_id": fill_run_id,
            }),
        )?;
        Ok(job.id)
    }

    /// Resumes a template-fill chain after user review of the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error when the job is not awaiting review.
    pub fn resume_template_fill(
        &self,
        job_id: &str,
        reviewed_mapping: serde_json::Value,
    ) -> Result<()> {
        let job = with_store(&self.store, |s| s.get_job(job_id))?
            .ok_or_else(|| StorageError::JobNotFound {
                id: job_id.to_string(),
            })?;
        if job.status != crate::core::JobStatus::AwaitingReview {
            return Err(PipelineError::NotRetryable {
                job_id: job_id.to_string(),
                reason: "job is not awaiting review".to_string(),
            }
            .into());
        }
        let fill_run_id = job.parent.id().to_string();
        self.enqueue(
            "fill",
            serde_json::json!({
                "chain": "template_fill",
                "job_id": job_id,
                "fill_run_id": fill_run_id,
                "mapping": reviewed_mapping,
            }),
        )
    }

    /// Retries a failed extraction from its last completed stage.
    ///
    /// Eligible when the record is failed and the expensive summarization
    /// stage completed: error fields are cleared, the run returns to
    /// `processing`, and only `extract_structured → store_result` re-run
    /// from the persisted intermediate.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotRetryable`] when the job has no resume
    /// point.
    pub fn retry_extraction(&self, extraction_id: &str) -> Result<String> {
        let record = with_store(&self.store, |s| s.get_extraction(extraction_id))?
            .ok_or_else(|| StorageError::ExtractionNotFound {
                id: extraction_id.to_string(),
            })?;
        if record.status != ExtractionStatus::Failed {
            return Err(PipelineError::NotRetryable {
                job_id: extraction_id.to_string(),
                reason: format!("extraction is {}", record.status.as_str()),
            }
            .into());
        }

        let mut job = with_store(&self.store, |s| {
            s.get_job_for_parent(&JobParent::Extraction(extraction_id.to_string()))
        })?
        .ok_or_else(|| StorageError::JobNotFound {
            id: extraction_id.to_string(),
        })?;

        if !job.stage_complete("summarizing") {
            return Err(PipelineError::NotRetryable {
                job_id: job.id,
                reason: "summarization has not completed; resubmit instead".to_string(),
            }
            .into());
        }

        job.reset_for_retry();
        with_store(&self.store, |s| s.update_job(&job))?;

        let mut record = record;
        record.status = ExtractionStatus::Processing;
        record.error_message = None;
        with_store(&self.store, |s| s.update_extraction(&record))?;

        let mut payload = serde_json::json!({
            "chain": "extract",
            "job_id": job.id,
            "extraction_id": record.id,
            "document_id": record.document_id,
            "context": record.context,
        });
        for (stage, key) in &job.intermediate_artifacts {
            payload[format!("{stage}_artifact")] = serde_json::json!(key);
        }

        self.enqueue("extract_structured", payload)?;
        Ok(job.id)
    }

    fn load_template(&self, name: &str) -> Result<WorkflowTemplate> {
        if let Some(template) = with_store(&self.store, |s| s.find_template_by_name(name))? {
            return Ok(template);
        }
        match name {
            "Investment Memo" => Ok(investment_memo_template()),
            "Red Flag Analysis" => Ok(red_flags_template()),
            _ => Err(StorageError::WorkflowNotFound {
                id: name.to_string(),
            }
            .into()),
        }
    }

    // ==================== Stage implementations ====================

    async fn stage_parse(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let document_id = str_field(&payload, "document_id")?;
        let file_path = str_field(&payload, "file_path")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("parse", 10, "Parsing document", &[], None)?;

        let kind = payload["parser"]
            .as_str()
            .and_then(parser_kind_from_str)
            .unwrap_or(ParserKind::Plain);
        let parser = self.parsers.resolve(kind)?;
        let output = parser.parse(std::path::Path::new(&file_path))?;

        let key = format!("parsed/{document_id}.json");
        let pointer = store_json(
            self.artifacts.as_ref(),
            &key,
            &serde_json::to_value(&output).map_err(StorageError::from)?,
        )?;

        with_store(&self.store, |s| {
            let mut doc = s
                .get_document(&document_id)?
                .ok_or_else(|| StorageError::DocumentNotFound {
                    id: document_id.clone(),
                })?;
            doc.status = DocumentStatus::Chunking;
            doc.page_count = Some(output.page_count);
            doc.parser = Some(output.parser_name.clone());
            doc.parse_artifact = Some(pointer);
            s.update_document(&doc)
        })?;

        tracker.update_progress(
            "parse",
            20,
            "Document parsed",
            &["parsing"],
            Some(("parse", &key)),
        )?;

        let mut payload = payload;
        payload["parse_artifact"] = serde_json::json!(key);
        Ok(StageResult {
            payload,
            next_stage: Some("chunk".to_string()),
        })
    }

    async fn stage_chunk(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let document_id = str_field(&payload, "document_id")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("chunk", 30, "Chunking document", &[], None)?;

        let output = self.load_parser_output(&payload)?;
        let chunks = self.chunker.chunk(&document_id, &output)?;

        with_store(&self.store, |s| {
            let mut doc = s
                .get_document(&document_id)?
                .ok_or_else(|| StorageError::DocumentNotFound {
                    id: document_id.clone(),
                })?;
            doc.status = DocumentStatus::Embedding;
            s.update_document(&doc)
        })?;

        let rowids = with_store(&self.store, |s| s.add_chunks(&chunks))?;

        // Embed all chunk texts in one batch
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        let batch: Vec<(i64, Vec<f32>)> = rowids.into_iter().zip(embeddings).collect();
        with_store(&self.store, |s| {
            s.store_embeddings_batch(&batch, Some("all-MiniLM-L6-v2"))
        })?;

        with_store(&self.store, |s| {
            let mut doc = s
                .get_document(&document_id)?
                .ok_or_else(|| StorageError::DocumentNotFound {
                    id: document_id.clone(),
                })?;
            doc.status = DocumentStatus::Completed;
            s.update_document(&doc)
        })?;

        tracker.update_progress(
            "chunk",
            50,
            &format!("{} chunks indexed", chunks.len()),
            &["chunking", "embedding"],
            None,
        )?;

        if payload["chain"] == "ingest" {
            tracker.mark_completed()?;
            return Ok(StageResult {
                payload,
                next_stage: None,
            });
        }
        Ok(StageResult {
            payload,
            next_stage: Some("summarize".to_string()),
        })
    }

    async fn stage_summarize(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let document_id = str_field(&payload, "document_id")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("summarize", 55, "Summarizing document", &[], None)?;

        let output = self.load_parser_output(&payload)?;
        let mut payload = payload;

        if output.text.len() > SUMMARIZE_THRESHOLD_CHARS {
            let chunks = with_store(&self.store, |s| s.chunks_for_document(&document_id))?;
            let narrative: Vec<String> = chunks
                .iter()
                .filter(|row| row.chunk.kind == crate::core::ChunkKind::Narrative)
                .take(SUMMARIZE_CHUNK_LIMIT)
                .map(|row| {
                    let text: String = row.chunk.text.chars().take(2000).collect();
                    format!("[Page {}] {}", row.chunk.page_number, text)
                })
                .collect();

            let prompt = format!(
                "Summarize each excerpt in 1-2 sentences, keeping page markers and all figures:\n\n{}",
                narrative.join("\n\n")
            );
            let (summary, _usage) = self.llm.cheap_text(&prompt).await.map_err(Error::from)?;

            let key = format!("summaries/{document_id}.json");
            store_json(
                self.artifacts.as_ref(),
                &key,
                &serde_json::json!({ "summaries": summary }),
            )?;
            payload["summarize_artifact"] = serde_json::json!(key);
            tracker.update_progress(
                "summarize",
                65,
                "Summaries persisted",
                &["summarizing"],
                Some(("summarizing", &key)),
            )?;
        } else {
            // Small document: nothing to compress, stage completes directly
            tracker.update_progress("summarize", 65, "Summarization skipped", &["summarizing"], None)?;
        }

        Ok(StageResult {
            payload,
            next_stage: Some("extract_structured".to_string()),
        })
    }

    async fn stage_extract_structured(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("extract_structured", 70, "Extracting structured data", &[], None)?;

        let output = self.load_parser_output(&payload)?;

        // Prefer the persisted summaries intermediate when present (this is
        // the resume point after summarization)
        let mut input = String::new();
        if let Some(key) = payload["summarize_artifact"].as_str().or_else(|| {
            payload["summarizing_artifact"].as_str()
        }) {
            let pointer = ArtifactPointer::file(key, None, None);
            if let Ok(value) = crate::storage::load_json(self.artifacts.as_ref(), &pointer)
                && let Some(summaries) = value["summaries"].as_str()
            {
                input.push_str("=== SUMMARIES ===\n");
                input.push_str(summaries);
                input.push_str("\n\n");
            }
        }
        input.push_str("=== CONTENT ===\n");
        input.push_str(&output.text);

        let context = payload["context"].as_str().map(|c| {
            format!("\n\nUSER CONTEXT (guidance for extraction): {c}")
        });
        if let Some(context) = context {
            input.push_str(&context);
        }

        let extraction = self
            .llm
            .extract_structured(&input, Some(EXTRACTION_SYSTEM_PROMPT), true)
            .await
            .map_err(Error::from)?;

        let extraction_id = str_field(&payload, "extraction_id")?;
        let key = format!("extractions/{extraction_id}.json");
        store_json(
            self.artifacts.as_ref(),
            &key,
            &serde_json::json!({
                "parsed": extraction.parsed,
                "raw": extraction.raw_text,
                "usage": extraction.usage,
                "model": extraction.model,
            }),
        )?;

        let mut payload = payload;
        payload["result_artifact"] = serde_json::json!(key);
        payload["token_usage"] = serde_json::json!(extraction.usage.total_tokens);
        payload["cost_usd"] = serde_json::json!(extraction.cost_usd);

        tracker.update_progress(
            "extract_structured",
            85,
            "Structured data extracted",
            &["extracting"],
            Some(("extracting", &key)),
        )?;

        Ok(StageResult {
            payload,
            next_stage: Some("store_result".to_string()),
        })
    }

    async fn stage_store_result(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let extraction_id = str_field(&payload, "extraction_id")?;
        let key = str_field(&payload, "result_artifact")?;
        let tracker = self.tracker(&job_id);

        let pointer = ArtifactPointer::file(&key, None, Some("application/json".to_string()));
        let content_hash = with_store(&self.store, |s| {
            let mut record = s
                .get_extraction(&extraction_id)?
                .ok_or_else(|| StorageError::ExtractionNotFound {
                    id: extraction_id.clone(),
                })?;
            record.status = ExtractionStatus::Completed;
            record.artifact = Some(pointer.clone());
            record.token_usage = payload["token_usage"].as_u64();
            record.cost_usd = payload["cost_usd"].as_f64();
            s.update_extraction(&record)?;
            Ok(record.content_hash)
        })?;

        // Global dedup cache so identical re-uploads short-circuit
        with_store(&self.store, |s| {
            s.cache_put(
                &content_hash,
                &serde_json::to_value(&pointer).map_err(StorageError::from)?,
            )
        })?;

        tracker.update_progress("store_result", 100, "Extraction complete", &[], None)?;
        tracker.mark_completed()?;
        Ok(StageResult {
            payload,
            next_stage: None,
        })
    }

    async fn stage_prepare_context(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let run_id = str_field(&payload, "run_id")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("prepare_context", 10, "Building workflow context", &[], None)?;

        let run = with_store(&self.store, |s| s.get_run(&run_id))?
            .ok_or_else(|| StorageError::RunNotFound { id: run_id.clone() })?;
        let template = self.load_template(run.template_name())?;

        let builder = ContextBuilder::new(
            &self.store,
            &self.retriever,
            &self.reranker,
            self.config.map_reduce_token_threshold,
            self.config.workflow_context_max_chars,
        );
        let prepared = builder.prepare(&run, &template.retrieval_spec).await?;

        with_store(&self.store, |s| {
            let mut run = s
                .get_run(&run_id)?
                .ok_or_else(|| StorageError::RunNotFound { id: run_id.clone() })?;
            run.strategy = Some(prepared.mode.as_str().to_string());
            s.update_run(&run)
        })?;

        let mut payload = payload;
        payload["prepared_context"] =
            serde_json::to_value(&prepared).map_err(StorageError::from)?;

        tracker.update_progress("prepare_context", 35, "Context assembled", &["context"], None)?;
        Ok(StageResult {
            payload,
            next_stage: Some("generate_artifact".to_string()),
        })
    }

    async fn stage_generate_artifact(&self, payload: serde_json::Value) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let run_id = str_field(&payload, "run_id")?;
        let tracker = self.tracker(&job_id);
        tracker.update_progress("generate_artifact", 50, "Generating artifact", &[], None)?;

        let run = with_store(&self.store, |s| s.get_run(&run_id))?
            .ok_or_else(|| StorageError::RunNotFound { id: run_id.clone() })?;
        let template = self.load_template(run.template_name())?;
        let prepared: PreparedContext =
            serde_json::from_value(payload["prepared_context"].clone())
                .map_err(StorageError::from)?;

        let generator = Generator::new(&self.llm, &self.registry);
        let outcome = generator.generate(&run, &template, &prepared).await?;

        // Budget checks warn without failing the run
        if u64::from(outcome.usage.total_tokens) > self.config.workflow_max_tokens_per_run {
            tracing::warn!(
                run_id = %run_id,
                tokens = outcome.usage.total_tokens,
                budget = self.config.workflow_max_tokens_per_run,
                "workflow run exceeded token budget"
            );
        }
        if outcome.cost_usd > self.config.workflow_max_cost_per_run_usd {
            tracing::warn!(
                run_id = %run_id,
                cost_usd = outcome.cost_usd,
                budget_usd = self.config.workflow_max_cost_per_run_usd,
                "workflow run exceeded cost budget"
            );
        }

        // Persist the artifact under a dated export key
        let now = current_timestamp();
        let key = crate::storage::export_key(&template.name, &run.id, now, "artifact.json");
        let pointer = store_json(self.artifacts.as_ref(), &key, &outcome.artifact)?;

        // Terminal run transition: latency is observed exactly once, here
        let completed = !outcome.partial;
        with_store(&self.store, |s| {
            let mut run = s
                .get_run(&run_id)?
                .ok_or_else(|| StorageError::RunNotFound { id: run_id.clone() })?;
            run.status = if completed {
                RunStatus::Completed
            } else {
                RunStatus::PartialFailed
            };
            run.artifact = Some(pointer.clone());
            run.token_usage = Some(u64::from(outcome.usage.total_tokens));
            run.cost_usd = Some(outcome.cost_usd);
            run.currency = outcome.parsed["currency"].as_str().map(str::to_string);
            run.citations_count = u32::try_from(outcome.citations_used.len()).unwrap_or(u32::MAX);
            run.citation_invalid_count =
                u32::try_from(outcome.invalid_citations.len()).unwrap_or(u32::MAX);
            run.attempts = outcome.attempts;
            run.validation_errors = Some(serde_json::json!({
                "errors": outcome.validation_errors,
                "warnings": outcome.warnings,
            }));
            run.latency_ms = u64::try_from((now - run.created_at).max(0) * 1000).ok();
            if !completed {
                run.error_message = outcome
                    .validation_errors
                    .first()
                    .map(|e| e.message.clone());
            }
            s.update_run(&run)
        })?;

        if completed {
            tracker.update_progress(
                "generate_artifact",
                100,
                "Artifact generated & validated",
                &["artifact", "validation"],
                Some(("artifact", &key)),
            )?;
            tracker.mark_completed()?;
        } else {
            tracker.mark_error(
                "generate_artifact",
                &outcome
                    .validation_errors
                    .first()
                    .map_or_else(|| "validation failed".to_string(), |e| e.message.clone()),
                crate::error::StageErrorKind::ValidationError,
            )?;
        }

        Ok(StageResult {
            payload,
            next_stage: None,
        })
    }

    async fn stage_template_fill(
        &self,
        stage: &str,
        payload: serde_json::Value,
    ) -> Result<StageResult> {
        let job_id = str_field(&payload, "job_id")?;
        let fill_run_id = str_field(&payload, "fill_run_id")?;
        let tracker = self.tracker(&job_id);
        let ops = self.template_fill.as_ref().ok_or_else(|| Error::Config {
            message: "no template-fill backend configured".to_string(),
        })?;

        let mut payload = payload;
        let next = match stage {
            "analyze_template" => {
                tracker.update_progress(stage, 15, "Analyzing template", &[], None)?;
                let analysis = ops.analyze(&fill_run_id)?;
                payload["analysis"] = analysis;
                tracker.update_progress(stage, 25, "Template analyzed", &["analyze_template"], None)?;
                Some("detect_fields".to_string())
            }
            "detect_fields" => {
                tracker.update_progress(stage, 40, "Detecting fields", &[], None)?;
                let fields = ops.detect_fields(&fill_run_id, &payload["analysis"])?;
                payload["fields"] = fields;
                tracker.update_progress(stage, 50, "Fields detected", &["detect_fields"], None)?;
                Some("auto_map".to_string())
            }
            "auto_map" => {
                tracker.update_progress(stage, 65, "Mapping fields", &[], None)?;
                let mapping = ops.auto_map(&fill_run_id, &payload["fields"])?;
                payload["mapping"] = mapping;
                tracker.update_progress(stage, 75, "Mapping proposed", &["auto_map"], None)?;
                // Chain pauses for user review; resume_template_fill
                // enqueues the fill stage
                tracker.mark_awaiting_review("Mapping awaits user review")?;
                None
            }
            "fill" => {
                tracker.update_progress(stage, 85, "Filling template", &[], None)?;
                let result = ops.fill(&fill_run_id, &payload["mapping"])?;
                payload["fill_result"] = result;
                tracker.update_progress(stage, 100, "Template filled", &["fill"], None)?;
                tracker.mark_completed()?;
                None
            }
            other => {
                return Err(Error::InvalidState {
                    message: format!("unknown template-fill stage '{other}'"),
                });
            }
        };

        Ok(StageResult {
            payload,
            next_stage: next,
        })
    }

    fn load_parser_output(&self, payload: &serde_json::Value) -> Result<ParserOutput> {
        let key = payload["parse_artifact"]
            .as_str()
            .map(str::to_string)
            .or_else(|| payload["parse_artifact_key"].as_str().map(str::to_string));

        let pointer = if let Some(key) = key {
            ArtifactPointer::file(key, None, None)
        } else {
            // Resume path: read the pointer from the document record
            let document_id = str_field(payload, "document_id")?;
            with_store(&self.store, |s| s.get_document(&document_id))?
                .and_then(|d| d.parse_artifact)
                .ok_or_else(|| Error::InvalidState {
                    message: "no parse artifact available".to_string(),
                })?
        };

        let value = crate::storage::load_json(self.artifacts.as_ref(), &pointer)?;
        serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()).into())
    }
}

#[async_trait]
impl StageExecutor for PipelineEngine {
    async fn execute(&self, stage: &str, payload: serde_json::Value) -> Result<StageResult> {
        match stage {
            "parse" => self.stage_parse(payload).await,
            "chunk" => self.stage_chunk(payload).await,
            "summarize" => self.stage_summarize(payload).await,
            "extract_structured" => self.stage_extract_structured(payload).await,
            "store_result" => self.stage_store_result(payload).await,
            "prepare_context" => self.stage_prepare_context(payload).await,
            "generate_artifact" => self.stage_generate_artifact(payload).await,
            "analyze_template" | "detect_fields" | "auto_map" | "fill" => {
                self.stage_template_fill(stage, payload).await
            }
            other => Err(Error::InvalidState {
                message: format!("unknown stage '{other}'"),
            }),
        }
    }

    async fn on_failure(&self, stage: &str, payload: serde_json::Value, error: &Error) {
        let kind = error.stage_kind();
        let message = error.to_string();

        if let Some(job_id) = payload["job_id"].as_str() {
            let tracker = self.tracker(job_id);
            if let Err(e) = tracker.mark_error(stage, &message, kind) {
                tracing::error!(job_id, error = %e, "failed to mark job error");
            }
        }

        // Mark the parent record failed; downstream tasks observe the
        // status and pass through without work
        let result = match payload["chain"].as_str() {
            Some("extract") => {
                payload["extraction_id"].as_str().map_or(Ok(()), |id| {
                    with_store(&self.store, |s| {
                        if let Some(mut record) = s.get_extraction(id)? {
                            record.status = ExtractionStatus::Failed;
                            record.error_message = Some(message.clone());
                            s.update_extraction(&record)?;
                        }
                        Ok(())
                    })
                })
            }
            Some("workflow") => payload["run_id"].as_str().map_or(Ok(()), |id| {
                with_store(&self.store, |s| {
                    if let Some(mut run) = s.get_run(id)? {
                        run.status = RunStatus::Failed;
                        run.error_message = Some(message.clone());
                        run.latency_ms =
                            u64::try_from((current_timestamp() - run.created_at).max(0) * 1000)
                                .ok();
                        s.update_run(&run)?;
                    }
                    Ok(())
                })
            }),
            Some("ingest") => payload["document_id"].as_str().map_or(Ok(()), |id| {
                with_store(&self.store, |s| {
                    if let Some(mut doc) = s.get_document(id)? {
                        doc.status = DocumentStatus::Failed;
                        s.update_document(&doc)?;
                    }
                    Ok(())
                })
            }),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(stage, error = %e, "failed to mark parent record failed");
        }
    }
}

fn str_field(payload: &serde_json::Value, field: &str) -> Result<String> {
    payload[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidState {
            message: format!("payload missing '{field}'"),
        })
}

fn parser_kind_from_str(s: &str) -> Option<ParserKind> {
    match s {
        "azure" => Some(ParserKind::Azure),
        "pymupdf" => Some(ParserKind::PyMuPdf),
        "llmwhisperer" => Some(ParserKind::LlmWhisperer),
        "plain" => Some(ParserKind::Plain),
        _ => None,
    }
}

fn path_filename(path: &std::path::Path) -> String {
    path.file_name()
        .map_or_else(|| path.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned())
}
