//! Prompt generator registry.
//!
//! Each workflow template ships a pure function
//! `(variables, custom_prompt?) -> {system_prompt, user_message_template}`.
//! Generators are registered in an explicit name-keyed function table; a
//! missing entry is a non-retryable configuration error, surfaced at
//! startup by [`PromptRegistry::validate_templates`] rather than at first
//! use.

use std::collections::HashMap;

use crate::core::WorkflowTemplate;
use crate::error::WorkflowError;

/// Rendered prompt pair for one run.
#[derive(Debug, Clone)]
pub struct GeneratedPrompt {
    /// System prompt carrying the output contract (section list, citation
    /// rules, enum vocabularies). Byte-stable per template+variables so
    /// provider prompt caching can engage.
    pub system_prompt: String,
    /// User message template containing a `{{CONTEXT}}` placeholder the
    /// engine replaces with the assembled context.
    pub user_message_template: String,
}

/// A prompt generator: pure function from variables (and an optional
/// custom user objective) to the rendered prompt pair.
pub type PromptGenerator =
    fn(&serde_json::Value, Option<&str>) -> Result<GeneratedPrompt, WorkflowError>;

/// Name-keyed prompt generator table.
pub struct PromptRegistry {
    generators: HashMap<String, PromptGenerator>,
}

impl std::fmt::Debug for PromptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRegistry")
            .field("registered", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PromptRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generators: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in generators registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("Investment Memo", investment_memo_prompt);
        registry.register("Red Flag Analysis", red_flags_prompt);
        registry
    }

    /// Registers a generator for a template name.
    pub fn register(&mut self, name: &str, generator: PromptGenerator) {
        self.generators.insert(name.to_string(), generator);
    }

    /// Resolves the generator for a template name.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::MissingPromptGenerator`] when the template
    /// has no registered generator (a configuration fault).
    pub fn resolve(&self, name: &str) -> Result<PromptGenerator, WorkflowError> {
        self.generators
            .get(name)
            .copied()
            .ok_or_else(|| WorkflowError::MissingPromptGenerator {
                name: name.to_string(),
            })
    }

    /// Startup check: every template must have a registered generator.
    ///
    /// # Errors
    ///
    /// Returns the first missing registration.
    pub fn validate_templates(&self, templates: &[WorkflowTemplate]) -> Result<(), WorkflowError> {
        for template in templates {
            self.resolve(&template.name)?;
        }
        Ok(())
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Substitutes `{{name}}` placeholders with variable values.
fn substitute(template: &str, variables: &serde_json::Value) -> String {
    let mut rendered = template.to_string();
    if let Some(map) = variables.as_object() {
        for (key, value) in map {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &replacement);
        }
    }
    rendered
}

fn flag(variables: &serde_json::Value, name: &str) -> bool {
    variables.get(name).and_then(serde_json::Value::as_bool).unwrap_or(false)
}

/// Prompt generator for the Investment Memo template.
///
/// # Errors
///
/// Returns a template error when required variables are absent after
/// safe-default merging.
pub fn investment_memo_prompt(
    variables: &serde_json::Value,
    custom_prompt: Option<&str>,
) -> Result<GeneratedPrompt, WorkflowError> {
    if variables.get("company_name").is_none() {
        return Err(WorkflowError::Template {
            message: "missing variable 'company_name'".to_string(),
        });
    }

    let objective = custom_prompt
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("USER OBJECTIVE:\n{p}\n\nFollow this objective while adhering to all formatting and structure requirements below.\n\n"))
        .unwrap_or_default();

    let conditional_sections = [
        (flag(variables, "include_financials"), "- Include financial & growth tables."),
        (flag(variables, "focus_risks"), "- Include extended risks/opportunities."),
        (flag(variables, "include_esg"), "- Include the ESG snapshot."),
        (
            flag(variables, "include_management_culture"),
            "- Include the management & culture section.",
        ),
        (
            flag(variables, "include_valuation") && flag(variables, "include_scenarios"),
            "- Include valuation scenarios (base/upside/downside).",
        ),
    ]
    .iter()
    .filter(|(enabled, _)| *enabled)
    .map(|(_, line)| *line)
    .collect::<Vec<_>>()
    .join("\n");

    let system_prompt = substitute(
        &format!(
            r#"Generate a professional-grade investment memo for {{{{company_name}}}} targeting {{{{target_audience}}}}.

{objective}OUTPUT STYLE (CRITICAL):
1) Produce a top-level "sections" array; it is the canonical output. Top-level objects (company_overview, financials, valuation, management, esg) are OPTIONAL MIRRORS and must match the corresponding section.
2) Citations use document-token form only, e.g. "[D1:p2]". Never numeric-only citations like "[1]".
3) Return STRICT JSON. No explanatory text, no code fences, no keys outside the contract.
4) If a field is unknown, OMIT it rather than set it to null. Exceptions: "risks" and "opportunities" must always be present (possibly empty arrays).
5) Output a top-level "currency" field: a 3-letter ISO code, or "UNKNOWN" when ambiguous (and note the ambiguity in "inconsistencies").

REQUIRED SECTIONS (in order, by key):
executive_overview, company_overview, market_competition, financial_performance,
unit_economics (optional), track_record_value_creation, risks, opportunities,
management_culture, esg_snapshot, valuation_scenarios, next_steps, inconsistencies

Dynamic inclusion:
{conditional_sections}

CONTENT RULES:
- Section content is well-formatted Markdown (headings, bold, bullets).
- Numbers carry units (M/B/K), percentages carry %, multiples carry x.
- Every quantitative claim carries an inline citation token.
- Store raw numbers in "financials" (111900000), formatted numbers in section content ($111.9M).
- financials.historical[].margin and metrics ratios are decimals (0.405 = 40.5%).

ENUM VOCABULARIES:
- risks[].severity: High | Medium | Low
- opportunities[].impact: High | Medium | Low
- esg.factors[].status: Positive | Neutral | Negative

"references" is the deduplicated union of every citation token used anywhere.
"meta.version" must be 2."#
        ),
        variables,
    );

    let user_message_template = r"Source material with citation tokens:

{{CONTEXT}}

Produce the investment memo JSON now. Cite only tokens that appear in the source material above."
        .to_string();

    Ok(GeneratedPrompt {
        system_prompt,
        user_message_template,
    })
}

/// Prompt generator for the Red Flag Analysis template.
///
/// # Errors
///
/// Never fails; the signature matches [`PromptGenerator`].
pub fn red_flags_prompt(
    variables: &serde_json::Value,
    custom_prompt: Option<&str>,
) -> Result<GeneratedPrompt, WorkflowError> {
    let objective = custom_prompt
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("\nUSER OBJECTIVE:\n{p}\n"))
        .unwrap_or_default();

    let system_prompt = substitute(
        &format!(
            r#"Identify diligence red flags for {{{{company_name}}}} from the provided source material.
{objective}
Return STRICT JSON: {{"red_flags": [{{"description", "category", "severity", "citations"}}], "references": [], "meta": {{"version": 1}}}}.
Severity is High | Medium | Low. Every red flag cites at least one document token ("[D1:p2]" form).
"references" is the deduplicated union of all citation tokens used."#
        ),
        variables,
    );

    Ok(GeneratedPrompt {
        system_prompt,
        user_message_template: "Source material:\n\n{{CONTEXT}}\n\nList the red flags now.".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::template::{investment_memo_template, red_flags_template};

    fn memo_variables() -> serde_json::Value {
        serde_json::json!({
            "company_name": "NPC International",
            "target_audience": "Investment Committee",
            "include_financials": true,
            "focus_risks": false,
            "include_esg": true,
            "include_management_culture": true,
            "include_valuation": true,
            "include_scenarios": true,
        })
    }

    #[test]
    fn test_builtin_registry_covers_builtin_templates() {
        let registry = PromptRegistry::with_builtin();
        registry
            .validate_templates(&[investment_memo_template(), red_flags_template()])
            .unwrap();
    }

    #[test]
    fn test_missing_generator_is_configuration_error() {
        let registry = PromptRegistry::with_builtin();
        let err = registry.resolve("Financial Analysis").unwrap_err();
        assert!(matches!(err, WorkflowError::MissingPromptGenerator { .. }));
    }

    #[test]
    fn test_memo_prompt_substitutes_variables() {
        let prompt = investment_memo_prompt(&memo_variables(), None).unwrap();
        assert!(prompt.system_prompt.contains("NPC International"));
        assert!(prompt.system_prompt.contains("Investment Committee"));
        assert!(!prompt.system_prompt.contains("{{company_name}}"));
        assert!(prompt.user_message_template.contains("{{CONTEXT}}"));
    }

    #[test]
    fn test_memo_prompt_custom_objective() {
        let prompt =
            investment_memo_prompt(&memo_variables(), Some("Focus on churn risk")).unwrap();
        assert!(prompt.system_prompt.contains("USER OBJECTIVE"));
        assert!(prompt.system_prompt.contains("Focus on churn risk"));
    }

    #[test]
    fn test_memo_prompt_missing_company_name() {
        let err = investment_memo_prompt(&serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, WorkflowError::Template { .. }));
    }

    #[test]
    fn test_memo_prompt_is_deterministic() {
        // Byte-stable output is what makes provider prompt caching work
        let a = investment_memo_prompt(&memo_variables(), None).unwrap();
        let b = investment_memo_prompt(&memo_variables(), None).unwrap();
        assert_eq!(a.system_prompt, b.system_prompt);
        assert_eq!(a.user_message_template, b.user_message_template);
    }

    #[test]
    fn test_conditional_sections_respond_to_flags() {
        let mut vars = memo_variables();
        vars["include_esg"] = serde_json::json!(false);
        let without = investment_memo_prompt(&vars, None).unwrap();
        assert!(!without.system_prompt.contains("Include the ESG snapshot"));

        let with = investment_memo_prompt(&memo_variables(), None).unwrap();
        assert!(with.system_prompt.contains("Include the ESG snapshot"));
    }

    #[test]
    fn test_red_flags_prompt() {
        let prompt =
            red_flags_prompt(&serde_json::json!({"company_name": "Acme"}), None).unwrap();
        assert!(prompt.system_prompt.contains("Acme"));
        assert!(prompt.user_message_template.contains("{{CONTEXT}}"));
    }
}
