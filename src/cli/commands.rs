//! CLI command execution.

// The CLI is the one place that prints
#![allow(clippy::print_stdout)]

use std::sync::Arc;

use super::output::{OutputFormat, print_heading, print_line, print_record};
use super::parser::{Cli, Commands};
use crate::chat::{ChatEvent, ChatOptions, ChatOrchestrator};
use crate::config::EngineConfig;
use crate::core::ChatSession;
use crate::embedding::create_embedder;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::parse::{ParserFactory, ParserKind};
use crate::pipeline::{PipelineEngine, ProgressEvent};
use crate::retrieval::{HybridRetriever, Reranker};
use crate::storage::{ChunkFilter, SqliteStore, shared, with_store};
use crate::workflow::PromptRegistry;

/// Wired process-level singletons for one CLI invocation.
struct Runtime {
    config: EngineConfig,
    engine: Arc<PipelineEngine>,
    store: crate::storage::SharedStore,
    llm: Arc<LlmClient>,
    embedder: Arc<dyn crate::embedding::Embedder>,
}

impl Runtime {
    /// Builds the runtime from environment + CLI flags. Commands that
    /// never reach the LLM run fine without an API key.
    fn build(cli: &Cli) -> Result<Self> {
        let config = EngineConfig::from_env().or_else(|_| {
            EngineConfig::builder()
                .api_key("offline")
                .from_env()
                .build()
        })
        .map_err(crate::Error::from)?;
        let config = EngineConfig {
            data_dir: cli.resolve_data_dir(),
            ..config
        };

        let mut sqlite = SqliteStore::open(config.db_path())?;
        sqlite.init()?;
        let store = shared(sqlite);

        let artifacts: Arc<dyn crate::storage::ArtifactStore> =
            Arc::new(crate::storage::FsArtifactStore::new(config.artifact_root()));
        let provider = crate::llm::create_provider(&config).map_err(crate::Error::from)?;
        let llm = Arc::new(LlmClient::new(provider, &config));
        let embedder: Arc<dyn crate::embedding::Embedder> = Arc::from(create_embedder()?);

        let engine = PipelineEngine::start(
            Arc::clone(&store),
            artifacts,
            Arc::clone(&llm),
            Arc::clone(&embedder),
            ParserFactory::with_builtin(),
            PromptRegistry::with_builtin(),
            config.clone(),
            None,
        );

        Ok(Self {
            config,
            engine,
            store,
            llm,
            embedder,
        })
    }
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns an error when the command fails; the binary maps it to a
/// non-zero exit.
#[allow(clippy::too_many_lines)]
pub async fn execute(cli: Cli) -> Result<()> {
    let format = OutputFormat::parse(&cli.format);
    let runtime = Runtime::build(&cli)?;

    match cli.command {
        Commands::Init { force } => {
            if force {
                with_store(&runtime.store, |s| s.reset())?;
            }
            print_line(format, &format!("initialized at {}", runtime.config.db_path().display()));
        }

        Commands::Status => {
            let stats = with_store(&runtime.store, |s| s.stats())?;
            print_record(format, &stats);
        }

        Commands::Ingest { file, user, org, parser, wait } => {
            let kind = parse_parser(&parser)?;
            let (document, job_id) = runtime.engine.ingest_document(&file, &user, &org, kind)?;
            print_record(
                format,
                &serde_json::json!({
                    "document_id": document.id,
                    "filename": document.filename,
                    "content_hash": document.content_hash,
                    "job_id": job_id,
                    "duplicate": job_id.is_none(),
                }),
            );
            if wait && let Some(job_id) = job_id {
                watch_job(&runtime, format, &job_id).await?;
            }
        }

        Commands::ListDocuments { org } => {
            let documents = with_store(&runtime.store, |s| s.list_documents(&org))?;
            for document in documents {
                print_record(
                    format,
                    &serde_json::json!({
                        "id": document.id,
                        "filename": document.filename,
                        "status": document.status.as_str(),
                        "pages": document.page_count,
                    }),
                );
            }
        }

        Commands::Extract { file, user, org, context, parser } => {
            let kind = parse_parser(&parser)?;
            let submission =
                runtime.engine.submit_extraction(&file, &user, &org, context, kind)?;
            print_record(
                format,
                &serde_json::json!({
                    "extraction_id": submission.record.id,
                    "status": submission.record.status.as_str(),
                    "from_history": submission.record.from_history,
                    "from_cache": submission.record.from_cache,
                    "job_id": submission.job_id,
                }),
            );
            if let Some(job_id) = submission.job_id {
                watch_job(&runtime, format, &job_id).await?;
            }
        }

        Commands::Retry { extraction_id } => {
            let job_id = runtime.engine.retry_extraction(&extraction_id)?;
            print_line(format, &format!("retrying, job {job_id}"));
            watch_job(&runtime, format, &job_id).await?;
        }

        Commands::Workflow { template, document, variables, prompt } => {
            let variables: serde_json::Value =
                serde_json::from_str(&variables).map_err(|e| crate::Error::Config {
                    message: format!("invalid --variables JSON: {e}"),
                })?;
            let (run, job_id) =
                runtime
                    .engine
                    .submit_workflow_run(&template, document, variables, prompt)?;
            print_record(
                format,
                &serde_json::json!({ "run_id": run.id, "job_id": job_id }),
            );
            watch_job(&runtime, format, &job_id).await?;

            if let Some(run) = with_store(&runtime.store, |s| s.get_run(&run.id))? {
                print_heading(format, "run");
                print_record(
                    format,
                    &serde_json::json!({
                        "status": run.status.as_str(),
                        "strategy": run.strategy,
                        "citations": run.citations_count,
                        "attempts": run.attempts,
                        "tokens": run.token_usage,
                        "cost_usd": run.cost_usd,
                        "currency": run.currency,
                    }),
                );
            }
        }

        Commands::Search { query, document, top_k } => {
            let retriever =
                HybridRetriever::new(Arc::clone(&runtime.store), Arc::clone(&runtime.embedder));
            let filter = document
                .as_deref()
                .map_or_else(ChunkFilter::default, ChunkFilter::document);
            let candidates = retriever.retrieve(&query, &filter, top_k * 2, None, 0.0)?;
            let ranked = Reranker::default()
                .rerank(&query, candidates, None, top_k)
                .await?;
            for result in ranked {
                print_record(
                    format,
                    &serde_json::json!({
                        "chunk_id": result.chunk.chunk_id,
                        "document_id": result.chunk.document_id,
                        "page": result.chunk.citation_page(),
                        "score": result.best_score(),
                        "snippet": result.chunk.first_sentence(),
                    }),
                );
            }
        }

        Commands::Chat { message, session, document } => {
            let session_id = match session {
                Some(id) => id,
                None => {
                    let mut new_session = ChatSession::new("local", "local", None);
                    new_session.document_ids = document;
                    with_store(&runtime.store, |s| s.insert_session(&new_session))?;
                    print_line(format, &format!("session {}", new_session.id));
                    new_session.id
                }
            };

            let orchestrator = ChatOrchestrator::new(
                Arc::clone(&runtime.store),
                Arc::clone(&runtime.llm),
                HybridRetriever::new(Arc::clone(&runtime.store), Arc::clone(&runtime.embedder)),
                Reranker::default(),
                runtime.config.clone(),
            );

            use futures_util::StreamExt;
            let mut stream = orchestrator
                .chat(&session_id, &message, ChatOptions::default())
                .await?;
            while let Some(event) = stream.next().await {
                match (format, event) {
                    (OutputFormat::Text, ChatEvent::Token(text)) => {
                        use std::io::Write;
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    (OutputFormat::Text, ChatEvent::End) => println!(),
                    (OutputFormat::Text, ChatEvent::Error { message }) => {
                        println!("\nerror: {message}");
                    }
                    (OutputFormat::Text, _) => {}
                    (OutputFormat::Json, event) => print!("{}", event.to_sse()),
                }
            }
        }

        Commands::Watch { job_id } => {
            watch_job(&runtime, format, &job_id).await?;
        }
    }

    Ok(())
}

/// Streams a job's progress events until `end`.
async fn watch_job(runtime: &Runtime, format: OutputFormat, job_id: &str) -> Result<()> {
    let (snapshot, mut receiver) = runtime.engine.subscribe(job_id)?;
    emit_event(format, &snapshot);
    if matches!(snapshot, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }) {
        return Ok(());
    }

    while let Ok(event) = receiver.recv().await {
        let done = matches!(event, ProgressEvent::End { .. });
        emit_event(format, &event);
        if done {
            break;
        }
    }
    Ok(())
}

fn emit_event(format: OutputFormat, event: &ProgressEvent) {
    match format {
        OutputFormat::Json => print!("{}", event.to_sse()),
        OutputFormat::Text => match event {
            ProgressEvent::Progress { stage, percent, message, .. } => {
                println!(
                    "[{percent:>3}%] {} {}",
                    stage.as_deref().unwrap_or("-"),
                    message.as_deref().unwrap_or("")
                );
            }
            ProgressEvent::Complete { .. } => println!("done"),
            ProgressEvent::Error { stage, message, error_type, .. } => {
                println!(
                    "failed at {} ({error_type}): {message}",
                    stage.as_deref().unwrap_or("?")
                );
            }
            ProgressEvent::ComparisonSelection { .. } | ProgressEvent::End { .. } => {}
        },
    }
}

fn parse_parser(name: &str) -> Result<ParserKind> {
    match name {
        "plain" => Ok(ParserKind::Plain),
        "azure" => Ok(ParserKind::Azure),
        "pymupdf" => Ok(ParserKind::PyMuPdf),
        "llmwhisperer" => Ok(ParserKind::LlmWhisperer),
        other => Err(crate::Error::Config {
            message: format!("unknown parser '{other}'"),
        }),
    }
}
