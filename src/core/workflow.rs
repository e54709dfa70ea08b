//! Workflow templates and runs.
//!
//! A template is a versioned, typed job definition; a run is one execution
//! of a template over concrete documents and variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a workflow variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Free-form text.
    String,
    /// Whole number with optional min.
    Integer,
    /// Floating-point with optional min.
    Number,
    /// True/false flag.
    Boolean,
    /// One of a fixed choice list.
    Enum,
}

/// A typed variable declaration in a template's variables schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Variable name as used in prompt templates.
    pub name: String,
    /// Declared type.
    pub var_type: VariableType,
    /// Explicit default, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Minimum for numeric types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Allowed choices for enum types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl VariableSpec {
    /// The safe default for this variable: the explicit default when present,
    /// otherwise a sensible zero value inferred from the type.
    #[must_use]
    pub fn safe_default(&self) -> serde_json::Value {
        if let Some(ref value) = self.default {
            return value.clone();
        }
        match self.var_type {
            VariableType::Boolean => serde_json::Value::Bool(false),
            VariableType::Integer => {
                #[allow(clippy::cast_possible_truncation)]
                serde_json::Value::from(self.min.unwrap_or(0.0) as i64)
            }
            VariableType::Number => serde_json::Value::from(self.min.unwrap_or(0.0)),
            VariableType::String => serde_json::Value::String(String::new()),
            VariableType::Enum => serde_json::Value::String(
                self.choices.first().cloned().unwrap_or_default(),
            ),
        }
    }
}

/// One section of a template's retrieval spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    /// Stable section key (e.g. "financial").
    pub key: String,
    /// Display title rendered into the context (e.g. "FINANCIAL HIGHLIGHTS").
    pub title: String,
    /// Retrieval queries run for this section.
    pub queries: Vec<String>,
    /// Whether table chunks get a relevance bonus.
    #[serde(default)]
    pub prefer_tables: bool,
    /// Maximum chunks selected for the section.
    pub max_chunks: usize,
    /// Ordering priority (lower first).
    #[serde(default)]
    pub priority: u32,
}

/// A versioned workflow job definition. Immutable per version; a new
/// version supersedes prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template id (UUID v4).
    pub id: String,
    /// Human-readable name; also the prompt-generator registry key.
    pub name: String,
    /// Business domain (e.g. "private_equity").
    pub domain: String,
    /// Typed variable declarations.
    pub variables: Vec<VariableSpec>,
    /// JSON schema the generated artifact must satisfy.
    pub output_schema: serde_json::Value,
    /// Ordered retrieval section specs.
    pub retrieval_spec: Vec<SectionSpec>,
    /// Minimum documents per run.
    pub min_documents: usize,
    /// Maximum documents per run.
    pub max_documents: usize,
    /// Template version.
    pub version: u32,
    /// Whether this version accepts new runs.
    pub active: bool,
}

impl WorkflowTemplate {
    /// Safe defaults for every declared variable, always including
    /// `custom_objective` so prompt rendering never fails on it.
    #[must_use]
    pub fn safe_defaults(&self) -> BTreeMap<String, serde_json::Value> {
        let mut defaults = BTreeMap::new();
        defaults.insert(
            "custom_objective".to_string(),
            serde_json::Value::String(String::new()),
        );
        for var in &self.variables {
            defaults.insert(var.name.clone(), var.safe_default());
        }
        defaults
    }
}

/// Execution mode of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One document.
    SingleDoc,
    /// Multiple documents.
    MultiDoc,
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started.
    Pending,
    /// Stages executing.
    Processing,
    /// Artifact produced and validated.
    Completed,
    /// Terminal failure.
    Failed,
    /// Failed, but a partial artifact was salvaged.
    PartialFailed,
}

impl RunStatus {
    /// Stable string form used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialFailed => "partial_failed",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partial_failed" => Some(Self::PartialFailed),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartialFailed)
    }
}

/// A single execution of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id (UUID v4).
    pub id: String,
    /// Template id.
    pub workflow_id: String,
    /// Snapshot of the template (name, version) taken at submission so the
    /// run survives template deletion.
    pub workflow_snapshot: serde_json::Value,
    /// Document ids in run-local citation order (D1, D2, ...).
    pub document_ids: Vec<String>,
    /// Concrete variable values.
    pub variables: serde_json::Value,
    /// User-supplied custom objective, if any.
    pub custom_prompt: Option<String>,
    /// Execution mode.
    pub mode: RunMode,
    /// Execution strategy chosen by context preparation ("direct" or
    /// "map_reduce"), once known.
    pub strategy: Option<String>,
    /// Run status.
    pub status: RunStatus,
    /// Pointer to the persisted artifact.
    pub artifact: Option<super::ArtifactPointer>,
    /// Total tokens consumed.
    pub token_usage: Option<u64>,
    /// Cost in USD.
    pub cost_usd: Option<f64>,
    /// Detected output currency.
    pub currency: Option<String>,
    /// Citation tokens used in the artifact.
    pub citations_count: u32,
    /// Invalid citation tokens observed (pre-repair).
    pub citation_invalid_count: u32,
    /// Validation errors persisted as JSON.
    pub validation_errors: Option<serde_json::Value>,
    /// Generation attempts made.
    pub attempts: u32,
    /// Terminal error message, if failed.
    pub error_message: Option<String>,
    /// Wall-clock latency of the run in milliseconds.
    pub latency_ms: Option<u64>,
    /// Unix timestamp of submission.
    pub created_at: i64,
}

impl WorkflowRun {
    /// Creates a run for a template over the given documents.
    #[must_use]
    pub fn new(
        template: &WorkflowTemplate,
        document_ids: Vec<String>,
        variables: serde_json::Value,
        custom_prompt: Option<String>,
    ) -> Self {
        let mode = if document_ids.len() <= 1 {
            RunMode::SingleDoc
        } else {
            RunMode::MultiDoc
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: template.id.clone(),
            workflow_snapshot: serde_json::json!({
                "name": template.name,
                "version": template.version,
                "domain": template.domain,
            }),
            document_ids,
            variables,
            custom_prompt,
            mode,
            strategy: None,
            status: RunStatus::Pending,
            artifact: None,
            token_usage: None,
            cost_usd: None,
            currency: None,
            citations_count: 0,
            citation_invalid_count: 0,
            validation_errors: None,
            attempts: 0,
            error_message: None,
            latency_ms: None,
            created_at: super::current_timestamp(),
        }
    }

    /// Template name from the snapshot.
    #[must_use]
    pub fn template_name(&self) -> &str {
        self.workflow_snapshot
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Unknown Workflow")
    }
}
