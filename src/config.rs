//! Engine configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.
//! All process-level singletons (store, embedder, LLM provider, artifact store)
//! are constructed from this record at startup and passed explicitly to
//! request and task handlers.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::LlmError;

/// Default narrative chunk token budget.
pub const DEFAULT_CHUNK_MAX_TOKENS: usize = 500;
/// Default retrieval candidate pool size.
pub const DEFAULT_RETRIEVAL_CANDIDATES: usize = 20;
/// Default final top-k after re-ranking.
pub const DEFAULT_FINAL_TOP_K: usize = 10;
/// Default minimum semantic similarity for chat retrieval.
pub const DEFAULT_SEMANTIC_SIMILARITY_FLOOR: f32 = 0.3;
/// Default rerank-score floor below which chunks are not expanded.
pub const DEFAULT_EXPANSION_RERANK_FLOOR: f32 = 0.35;
/// Default pairing/clustering similarity threshold for comparison.
pub const DEFAULT_COMPARISON_SIMILARITY_THRESHOLD: f32 = 0.6;
/// Default number of verbatim messages kept out of the summary.
pub const DEFAULT_VERBATIM_MESSAGE_COUNT: usize = 6;
/// Message count above which history is summarized.
pub const DEFAULT_SUMMARIZE_THRESHOLD: usize = 12;
/// Token threshold that switches workflow execution to map-reduce.
pub const DEFAULT_MAP_REDUCE_TOKEN_THRESHOLD: usize = 10_000;
/// Default hard character cap on assembled workflow context.
pub const DEFAULT_WORKFLOW_CONTEXT_MAX_CHARS: usize = 400_000;
/// Default maximum input characters per LLM call before 80/20 truncation.
pub const DEFAULT_LLM_MAX_INPUT_CHARS: usize = 350_000;
/// Default LLM read timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Default synthesis-call max tokens.
const DEFAULT_MAX_TOKENS: u32 = 8192;
/// Default cheap-call max tokens.
const DEFAULT_CHEAP_MAX_TOKENS: u32 = 2048;
/// Default max retries per LLM request.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-run token budget (warning only).
const DEFAULT_MAX_TOKENS_PER_RUN: u64 = 400_000;
/// Default per-run cost budget in USD (warning only).
const DEFAULT_MAX_COST_PER_RUN_USD: f64 = 5.0;
/// Default broker worker concurrency.
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Configuration for the document intelligence engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// LLM provider name (e.g., "openai").
    pub provider: String,
    /// API key for the provider.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model for synthesis calls (workflow generation, chat answers).
    pub synthesis_model: String,
    /// Model for cheap calls (summarization, query understanding).
    pub cheap_model: String,
    /// Maximum tokens for synthesis responses.
    pub max_tokens: u32,
    /// Maximum tokens for cheap-model responses.
    pub cheap_max_tokens: u32,
    /// Maximum input characters per call before smart truncation.
    pub max_input_chars: usize,
    /// LLM read timeout.
    pub timeout: Duration,
    /// Maximum retry attempts per LLM request.
    pub max_retries: u32,
    /// Narrative chunk token budget.
    pub chunk_max_tokens: usize,
    /// Retrieval candidate pool size (pre-rerank).
    pub retrieval_candidates: usize,
    /// Final top-k after re-ranking.
    pub final_top_k: usize,
    /// Minimum semantic similarity for dense retrieval.
    pub semantic_similarity_floor: f32,
    /// Rerank-score floor for context expansion.
    pub expansion_rerank_floor: f32,
    /// Similarity threshold for comparison pairing/clustering.
    pub comparison_similarity_threshold: f32,
    /// Maximum documents in a single comparison.
    pub comparison_max_documents: usize,
    /// Verbatim messages kept out of the conversation summary.
    pub verbatim_message_count: usize,
    /// Message count above which history is summarized.
    pub summarize_threshold: usize,
    /// Token threshold that switches workflows to map-reduce.
    pub map_reduce_token_threshold: usize,
    /// Hard character cap on assembled workflow context.
    pub workflow_context_max_chars: usize,
    /// Per-run token budget; exceeding it logs a warning.
    pub workflow_max_tokens_per_run: u64,
    /// Per-run cost budget in USD; exceeding it logs a warning.
    pub workflow_max_cost_per_run_usd: f64,
    /// Broker worker concurrency (tasks across runs in parallel).
    pub worker_concurrency: usize,
    /// Data directory (database file, artifact store root).
    pub data_dir: PathBuf,
}

impl EngineConfig {
    /// Creates a new builder for `EngineConfig`.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ApiKeyMissing`] if no API key is found.
    pub fn from_env() -> Result<Self, LlmError> {
        Self::builder().from_env().build()
    }

    /// Path to the `SQLite` database file under the data directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dossier.db")
    }

    /// Root directory of the filesystem artifact store.
    #[must_use]
    pub fn artifact_root(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    synthesis_model: Option<String>,
    cheap_model: Option<String>,
    max_tokens: Option<u32>,
    cheap_max_tokens: Option<u32>,
    max_input_chars: Option<usize>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    chunk_max_tokens: Option<usize>,
    retrieval_candidates: Option<usize>,
    final_top_k: Option<usize>,
    semantic_similarity_floor: Option<f32>,
    expansion_rerank_floor: Option<f32>,
    comparison_similarity_threshold: Option<f32>,
    comparison_max_documents: Option<usize>,
    verbatim_message_count: Option<usize>,
    summarize_threshold: Option<usize>,
    map_reduce_token_threshold: Option<usize>,
    workflow_context_max_chars: Option<usize>,
    workflow_max_tokens_per_run: Option<u64>,
    workflow_max_cost_per_run_usd: Option<f64>,
    worker_concurrency: Option<usize>,
    data_dir: Option<PathBuf>,
}

impl EngineConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = std::env::var("DOSSIER_PROVIDER").ok();
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("OPENAI_API_KEY")
                .or_else(|_| std::env::var("DOSSIER_API_KEY"))
                .ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("OPENAI_BASE_URL")
                .or_else(|_| std::env::var("DOSSIER_BASE_URL"))
                .ok();
        }
        if self.synthesis_model.is_none() {
            self.synthesis_model = std::env::var("DOSSIER_SYNTHESIS_MODEL").ok();
        }
        if self.cheap_model.is_none() {
            self.cheap_model = std::env::var("DOSSIER_CHEAP_MODEL").ok();
        }
        if self.timeout.is_none() {
            self.timeout = std::env::var("DOSSIER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
        }
        if self.retrieval_candidates.is_none() {
            self.retrieval_candidates = std::env::var("DOSSIER_RETRIEVAL_CANDIDATES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.final_top_k.is_none() {
            self.final_top_k = std::env::var("DOSSIER_FINAL_TOP_K")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.worker_concurrency.is_none() {
            self.worker_concurrency = std::env::var("DOSSIER_WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.data_dir.is_none() {
            self.data_dir = std::env::var("DOSSIER_DATA_DIR").ok().map(PathBuf::from);
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the synthesis model.
    #[must_use]
    pub fn synthesis_model(mut self, model: impl Into<String>) -> Self {
        self.synthesis_model = Some(model.into());
        self
    }

    /// Sets the cheap model used for summarization and query understanding.
    #[must_use]
    pub fn cheap_model(mut self, model: impl Into<String>) -> Self {
        self.cheap_model = Some(model.into());
        self
    }

    /// Sets the synthesis max tokens.
    #[must_use]
    pub const fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Sets the cheap-model max tokens.
    #[must_use]
    pub const fn cheap_max_tokens(mut self, n: u32) -> Self {
        self.cheap_max_tokens = Some(n);
        self
    }

    /// Sets the maximum input characters per LLM call.
    #[must_use]
    pub const fn max_input_chars(mut self, n: usize) -> Self {
        self.max_input_chars = Some(n);
        self
    }

    /// Sets the LLM request timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets the max retries per LLM request.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Sets the narrative chunk token budget.
    #[must_use]
    pub const fn chunk_max_tokens(mut self, n: usize) -> Self {
        self.chunk_max_tokens = Some(n);
        self
    }

    /// Sets the retrieval candidate pool size.
    #[must_use]
    pub const fn retrieval_candidates(mut self, n: usize) -> Self {
        self.retrieval_candidates = Some(n);
        self
    }

    /// Sets the final top-k after re-ranking.
    #[must_use]
    pub const fn final_top_k(mut self, n: usize) -> Self {
        self.final_top_k = Some(n);
        self
    }

    /// Sets the semantic similarity floor.
    #[must_use]
    pub const fn semantic_similarity_floor(mut self, floor: f32) -> Self {
        self.semantic_similarity_floor = Some(floor);
        self
    }

    /// Sets the comparison pairing similarity threshold.
    #[must_use]
    pub const fn comparison_similarity_threshold(mut self, threshold: f32) -> Self {
        self.comparison_similarity_threshold = Some(threshold);
        self
    }

    /// Sets the maximum documents per comparison.
    #[must_use]
    pub const fn comparison_max_documents(mut self, n: usize) -> Self {
        self.comparison_max_documents = Some(n);
        self
    }

    /// Sets the verbatim message count kept out of summaries.
    #[must_use]
    pub const fn verbatim_message_count(mut self, n: usize) -> Self {
        self.verbatim_message_count = Some(n);
        self
    }

    /// Sets the history-summarization threshold.
    #[must_use]
    pub const fn summarize_threshold(mut self, n: usize) -> Self {
        self.summarize_threshold = Some(n);
        self
    }

    /// Sets the map-reduce token threshold.
    #[must_use]
    pub const fn map_reduce_token_threshold(mut self, n: usize) -> Self {
        self.map_reduce_token_threshold = Some(n);
        self
    }

    /// Sets the hard workflow context character cap.
    #[must_use]
    pub const fn workflow_context_max_chars(mut self, n: usize) -> Self {
        self.workflow_context_max_chars = Some(n);
        self
    }

    /// Sets the broker worker concurrency.
    #[must_use]
    pub const fn worker_concurrency(mut self, n: usize) -> Self {
        self.worker_concurrency = Some(n);
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Builds the [`EngineConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ApiKeyMissing`] if no API key was set.
    pub fn build(self) -> Result<EngineConfig, LlmError> {
        let api_key = self.api_key.ok_or(LlmError::ApiKeyMissing)?;

        let data_dir = self.data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dossier")
        });

        Ok(EngineConfig {
            provider: self.provider.unwrap_or_else(|| "openai".to_string()),
            api_key,
            base_url: self.base_url,
            synthesis_model: self
                .synthesis_model
                .unwrap_or_else(|| "gpt-5.2-2025-12-11".to_string()),
            cheap_model: self
                .cheap_model
                .unwrap_or_else(|| "gpt-5-mini-2025-08-07".to_string()),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            cheap_max_tokens: self.cheap_max_tokens.unwrap_or(DEFAULT_CHEAP_MAX_TOKENS),
            max_input_chars: self.max_input_chars.unwrap_or(DEFAULT_LLM_MAX_INPUT_CHARS),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            chunk_max_tokens: self.chunk_max_tokens.unwrap_or(DEFAULT_CHUNK_MAX_TOKENS),
            retrieval_candidates: self
                .retrieval_candidates
                .unwrap_or(DEFAULT_RETRIEVAL_CANDIDATES),
            final_top_k: self.final_top_k.unwrap_or(DEFAULT_FINAL_TOP_K),
            semantic_similarity_floor: self
                .semantic_similarity_floor
                .unwrap_or(DEFAULT_SEMANTIC_SIMILARITY_FLOOR),
            expansion_rerank_floor: self
                .expansion_rerank_floor
                .unwrap_or(DEFAULT_EXPANSION_RERANK_FLOOR),
            comparison_similarity_threshold: self
                .comparison_similarity_threshold
                .unwrap_or(DEFAULT_COMPARISON_SIMILARITY_THRESHOLD),
            comparison_max_documents: self.comparison_max_documents.unwrap_or(3),
            verbatim_message_count: self
                .verbatim_message_count
                .unwrap_or(DEFAULT_VERBATIM_MESSAGE_COUNT),
            summarize_threshold: self
                .summarize_threshold
                .unwrap_or(DEFAULT_SUMMARIZE_THRESHOLD),
            map_reduce_token_threshold: self
                .map_reduce_token_threshold
                .unwrap_or(DEFAULT_MAP_REDUCE_TOKEN_THRESHOLD),
            workflow_context_max_chars: self
                .workflow_context_max_chars
                .unwrap_or(DEFAULT_WORKFLOW_CONTEXT_MAX_CHARS),
            workflow_max_tokens_per_run: self
                .workflow_max_tokens_per_run
                .unwrap_or(DEFAULT_MAX_TOKENS_PER_RUN),
            workflow_max_cost_per_run_usd: self
                .workflow_max_cost_per_run_usd
                .unwrap_or(DEFAULT_MAX_COST_PER_RUN_USD),
            worker_concurrency: self.worker_concurrency.unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            data_dir,
        })
    }
}
