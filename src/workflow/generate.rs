//! Workflow artifact generation: direct and map-reduce execution with a
//! citation/domain validation loop, corrective retries, and partial
//! salvage.

use std::collections::BTreeSet;

use serde_json::Value;

use super::context::{ExecutionMode, PreparedContext};
use super::normalize::normalize_output;
use super::registry::PromptRegistry;
use super::validate::{
    ValidationIssue, ValidationReport, validate_citations, validate_memo_constraints,
};
use crate::core::{WorkflowRun, WorkflowTemplate};
use crate::error::{Result, WorkflowError};
use crate::llm::{LlmClient, TokenUsage};
use crate::retrieval::compress_for_query;

/// Corrective retries after the first failed attempt.
const MAX_CORRECTIVE_RETRIES: u32 = 2;

/// Citation whitelist tokens listed in a corrective preamble.
const CORRECTIVE_WHITELIST_CAP: usize = 60;

/// Result of generating a workflow artifact.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Normalized parsed artifact.
    pub parsed: Value,
    /// Raw LLM response text (final attempt).
    pub raw_text: String,
    /// Full persisted artifact payload.
    pub artifact: Value,
    /// Accumulated token usage across attempts (and map phase).
    pub usage: TokenUsage,
    /// Accumulated USD cost.
    pub cost_usd: f64,
    /// Deduplicated citation tokens used.
    pub citations_used: Vec<String>,
    /// Invalid citation tokens observed on the final attempt.
    pub invalid_citations: Vec<String>,
    /// Attempts made (1-based).
    pub attempts: u32,
    /// Non-blocking warnings.
    pub warnings: Vec<ValidationIssue>,
    /// Blocking errors from the final attempt (empty when completed).
    pub validation_errors: Vec<ValidationIssue>,
    /// True when the run failed validation but a parsable object was
    /// salvaged as a partial artifact.
    pub partial: bool,
}

/// Workflow artifact generator.
pub struct Generator<'a> {
    llm: &'a LlmClient,
    registry: &'a PromptRegistry,
}

impl<'a> Generator<'a> {
    /// Creates a generator over the LLM client and prompt registry.
    #[must_use]
    pub const fn new(llm: &'a LlmClient, registry: &'a PromptRegistry) -> Self {
        Self { llm, registry }
    }

    /// Generates the artifact for a run.
    ///
    /// On validation failure the LLM call is re-issued up to two more times
    /// with a corrective preamble listing the violations and the allowed
    /// citation whitelist. On final failure a parsable object (if any) is
    /// salvaged as a partial artifact.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the template has no registered
    /// prompt generator, or [`WorkflowError::ValidationFailed`] when no
    /// object could be salvaged.
    pub async fn generate(
        &self,
        run: &WorkflowRun,
        template: &WorkflowTemplate,
        prepared: &PreparedContext,
    ) -> Result<GenerationOutcome> {
        // Missing generator is a non-retryable configuration error
        let generator = self.registry.resolve(&template.name)?;

        // Merge safe defaults under explicit variables so rendering never
        // fails on an absent optional variable
        let mut variables = serde_json::Map::new();
        for (name, value) in template.safe_defaults() {
            variables.insert(name, value);
        }
        if let Some(explicit) = run.variables.as_object() {
            for (name, value) in explicit {
                variables.insert(name.clone(), value.clone());
            }
        }
        let variables = Value::Object(variables);

        // Template errors (missing variable) pass through as-is; anything
        // else the generator throws is a prompt-generation fault
        let prompt = generator(&variables, run.custom_prompt.as_deref()).map_err(|e| match e {
            WorkflowError::Template { .. } => e,
            other => WorkflowError::PromptGeneration {
                name: template.name.clone(),
                message: other.to_string(),
            },
        })?;

        // The whitelist is the set of tokens present in the assembled context
        let whitelist: BTreeSet<String> =
            super::validate::used_citation_set(&prepared.combined_context);

        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0f64;

        // Map phase (map-reduce only): per-section briefs via the cheap model
        let synthesis_input = match prepared.mode {
            ExecutionMode::Direct => prepared.combined_context.clone(),
            ExecutionMode::MapReduce => {
                self.map_phase(prepared, &mut usage, &mut cost_usd).await?
            }
        };

        let user_message = prompt
            .user_message_template
            .replace("{{CONTEXT}}", &synthesis_input);
        let schema_name = slugify(&template.name);

        let mut system_prompt = prompt.system_prompt.clone();
        let mut last_parsed: Option<Value> = None;
        let mut last_raw = String::new();
        let mut last_errors: Vec<ValidationIssue> = Vec::new();
        let mut attempts = 0u32;

        while attempts <= MAX_CORRECTIVE_RETRIES {
            attempts += 1;
            tracing::info!(run_id = %run.id, attempt = attempts, "workflow generation attempt");

            let extraction = self
                .llm
                .extract_with_schema(
                    &user_message,
                    &system_prompt,
                    &schema_name,
                    template.output_schema.clone(),
                    true,
                )
                .await
                .map_err(crate::Error::from)?;

            usage.absorb(&extraction.usage);
            cost_usd += extraction.cost_usd.unwrap_or(0.0);
            last_raw.clone_from(&extraction.raw_text);

            // Citation pass over the raw response
            let (mut report, used, invalid) = validate_citations(
                &extraction.raw_text,
                &whitelist,
                run.document_ids.len(),
                prepared.combined_context.len(),
            );

            // Normalize, then domain checks for the flagship template
            let mut parsed = normalize_output(extraction.parsed);
            if template.name == "Investment Memo" {
                report.merge(validate_memo_constraints(&mut parsed));
            }
            last_parsed = Some(parsed.clone());

            if report.is_valid() {
                let artifact = build_artifact(
                    &extraction.raw_text,
                    &parsed,
                    prepared,
                    &report,
                    &used,
                    &invalid,
                    attempts,
                    self.llm.synthesis_model(),
                    false,
                );
                return Ok(GenerationOutcome {
                    parsed,
                    raw_text: extraction.raw_text,
                    artifact,
                    usage,
                    cost_usd,
                    citations_used: used,
                    invalid_citations: invalid,
                    attempts,
                    warnings: report.warnings,
                    validation_errors: Vec::new(),
                    partial: false,
                });
            }

            tracing::warn!(
                run_id = %run.id,
                attempt = attempts,
                errors = report.errors.len(),
                "validation failed"
            );
            last_errors.clone_from(&report.errors);

            if attempts <= MAX_CORRECTIVE_RETRIES {
                system_prompt = format!(
                    "{}\n\n{}",
                    prompt.system_prompt,
                    corrective_preamble(&report, &whitelist)
                );
            }
        }

        // Salvage: persist whatever parsed, mark the run failed-with-partial
        if let Some(parsed) = last_parsed {
            let report = ValidationReport {
                errors: last_errors.clone(),
                warnings: Vec::new(),
            };
            let artifact = build_artifact(
                &last_raw,
                &parsed,
                prepared,
                &report,
                &[],
                &[],
                attempts,
                self.llm.synthesis_model(),
                true,
            );
            return Ok(GenerationOutcome {
                parsed,
                raw_text: last_raw,
                artifact,
                usage,
                cost_usd,
                citations_used: Vec::new(),
                invalid_citations: Vec::new(),
                attempts,
                warnings: Vec::new(),
                validation_errors: last_errors,
                partial: true,
            });
        }

        Err(WorkflowError::ValidationFailed {
            attempts,
            reason: last_errors
                .first()
                .map_or_else(|| "no parsable output".to_string(), |e| e.message.clone()),
        }
        .into())
    }

    /// Map phase: summarize each section's chunks into a bounded brief with
    /// the cheap model, preserving figures and citation tokens.
    async fn map_phase(
        &self,
        prepared: &PreparedContext,
        usage: &mut TokenUsage,
        cost_usd: &mut f64,
    ) -> Result<String> {
        let mut briefs: Vec<String> = Vec::new();

        for section in &prepared.sections {
            if section.chunks.is_empty() {
                continue;
            }
            let section_query = section.queries.join(" ");

            // Compress narratives before the summarization call
            let mut lines: Vec<String> = Vec::new();
            for selected in &section.chunks {
                let chunk = &selected.retrieved.chunk;
                let text = if chunk.is_table() {
                    chunk.text.clone()
                } else {
                    compress_for_query(&section_query, &chunk.text)
                        .unwrap_or_else(|| chunk.text.clone())
                };
                lines.push(format!("{} {}", selected.citation, text));
            }

            let prompt = format!(
                "Summarize the following source excerpts for the '{}' section of a deal analysis. \
                 Preserve every figure and every citation token (the bracketed [D#:p#] markers) \
                 exactly as written. Maximum 300 words.\n\n{}",
                section.title,
                lines.join("\n")
            );

            let (brief, brief_usage) = self.llm.cheap_text(&prompt).await.map_err(crate::Error::from)?;
            usage.absorb(&brief_usage);
            *cost_usd += crate::llm::compute_cost(
                self.llm.cheap_model(),
                u64::from(brief_usage.prompt_tokens),
                u64::from(brief_usage.completion_tokens),
            )
            .unwrap_or(0.0);

            briefs.push(format!("=== SECTION: {} ===\n{brief}", section.title));
        }

        tracing::info!(sections = briefs.len(), "map phase complete");
        Ok(briefs.join("\n\n"))
    }
}

/// Builds the corrective preamble appended to the system prompt on retry.
fn corrective_preamble(report: &ValidationReport, whitelist: &BTreeSet<String>) -> String {
    let violations: Vec<String> = report
        .errors
        .iter()
        .map(|issue| format!("- {}: {}", issue.code, issue.message))
        .collect();

    let allowed: Vec<&str> = whitelist
        .iter()
        .take(CORRECTIVE_WHITELIST_CAP)
        .map(String::as_str)
        .collect();

    format!(
        "CORRECTION REQUIRED. Your previous response had these violations:\n{}\n\n\
         Use ONLY these citation tokens: {}",
        violations.join("\n"),
        allowed.join(" ")
    )
}

/// Assembles the persisted artifact payload.
#[allow(clippy::too_many_arguments)]
fn build_artifact(
    raw: &str,
    parsed: &Value,
    prepared: &PreparedContext,
    report: &ValidationReport,
    used: &[String],
    invalid: &[String],
    attempts: u32,
    model: &str,
    partial: bool,
) -> Value {
    // Rich citations: the parsed object's references joined with the
    // citation map's metadata
    let rich_citations: Vec<Value> = parsed["references"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|token| {
            prepared.citation_map.get(token).map_or_else(
                || {
                    serde_json::json!({
                        "token": token,
                        "document": "Unknown",
                        "page": null,
                        "section": null,
                        "snippet": token,
                    })
                },
                |meta| serde_json::to_value(meta).unwrap_or_default(),
            )
        })
        .collect();

    serde_json::json!({
        "raw": raw,
        "parsed": parsed,
        "citation_map": prepared.citation_map,
        "citation_snippets": prepared.citation_snippets,
        "rich_citations": rich_citations,
        "validation": {
            "attempts": attempts,
            "citation_count": used.len(),
            "invalid_citations": invalid,
            "warnings": report.warnings,
            "errors": report.errors,
            "finalized": !partial,
        },
        "summary": {
            "model": model,
            "format": "json",
            "partial": partial,
            "attempts": attempts,
            "execution_mode": prepared.mode.as_str(),
            "truncated_context": prepared.truncated,
        }
    })
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
