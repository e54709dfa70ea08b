//! Citation and domain validation of generated artifacts.
//!
//! Citations are validated against the whitelist of tokens present in the
//! assembled context: unknown tokens are errors; density below an adaptive
//! minimum is a warning. The Investment Memo additionally gets domain
//! checks the structured-output schema cannot express (section coverage,
//! enum vocabularies, parseable figures, currency consistency).

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::normalize::coerce_numeric;
use super::template::MEMO_REQUIRED_SECTIONS;

/// The only accepted citation token pattern.
pub fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\[D\d+:p\d+\]").unwrap()
    })
}

fn exact_citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\[D\d+:p\d+\]$").unwrap()
    })
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    /// Stable issue code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn new(code: &str, message: String) -> Self {
        Self {
            code: code.to_string(),
            message,
        }
    }
}

/// Outcome of a validation pass: hard errors block, warnings do not.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationReport {
    /// Blocking errors.
    pub errors: Vec<ValidationIssue>,
    /// Non-blocking warnings.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Whether the artifact passed (no hard errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Merges another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Extracts all citation tokens from raw text, in order of appearance.
#[must_use]
pub fn extract_citations(text: &str) -> Vec<String> {
    citation_re()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Deduplicated citation tokens used in the text.
#[must_use]
pub fn used_citation_set(text: &str) -> BTreeSet<String> {
    extract_citations(text).into_iter().collect()
}

/// Adaptive minimum citation count.
///
/// - 1 document: at least 3 tokens.
/// - 2+ documents: at least `min(15, 2 * docs)`.
/// - +2 when the assembled context exceeds 150 000 characters.
/// - Clamped down to half the whitelist when the whitelist is sparse.
#[must_use]
pub fn adaptive_min_citations(
    document_count: usize,
    context_chars: usize,
    whitelist_len: usize,
) -> usize {
    let mut minimum = if document_count <= 1 {
        3
    } else {
        (2 * document_count).min(15)
    };
    if context_chars > 150_000 {
        minimum += 2;
    }
    minimum.min((whitelist_len / 2).max(1))
}

/// Validates citations in a raw response against the context whitelist.
///
/// Unknown tokens are hard errors; density below the adaptive minimum is a
/// `citation_count_warning`.
#[must_use]
pub fn validate_citations(
    raw_text: &str,
    whitelist: &BTreeSet<String>,
    document_count: usize,
    context_chars: usize,
) -> (ValidationReport, Vec<String>, Vec<String>) {
    let used: Vec<String> = used_citation_set(raw_text).into_iter().collect();
    let invalid: Vec<String> = used
        .iter()
        .filter(|token| !whitelist.contains(*token))
        .cloned()
        .collect();

    let mut report = ValidationReport::default();

    if !invalid.is_empty() {
        report.errors.push(ValidationIssue::new(
            "citation_invalid",
            format!(
                "{} citation token(s) not present in the context: {}",
                invalid.len(),
                invalid
                    .iter()
                    .take(10)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }

    let minimum = adaptive_min_citations(document_count, context_chars, whitelist.len());
    if used.len() < minimum {
        report.warnings.push(ValidationIssue::new(
            "citation_count_warning",
            format!(
                "only {} citation(s) used, expected at least {minimum}",
                used.len()
            ),
        ));
    }

    (report, used, invalid)
}

/// Domain checks for the Investment Memo that the output schema cannot
/// express. Mutates the artifact where a clamp is the right fix
/// (confidence range, meta.version).
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn validate_memo_constraints(memo: &mut Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    // 1. Section coverage
    let section_keys: BTreeSet<String> = memo["sections"]
        .as_array()
        .map(|sections| {
            sections
                .iter()
                .filter_map(|s| s["key"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let missing: Vec<&str> = MEMO_REQUIRED_SECTIONS
        .iter()
        .filter(|key| !section_keys.contains(**key))
        .copied()
        .collect();
    if !missing.is_empty() {
        report.errors.push(ValidationIssue::new(
            "missing_sections",
            format!("missing sections: {}", missing.join(", ")),
        ));
    }

    // 2. Citation token format in references and per-section citations
    for reference in memo["references"].as_array().into_iter().flatten() {
        if let Some(token) = reference.as_str()
            && !exact_citation_re().is_match(token)
        {
            report.warnings.push(ValidationIssue::new(
                "invalid_citation_format",
                format!("bad citation in references: '{token}'"),
            ));
        }
    }

    // 3. Per-section checks: citation format, confidence clamp, word count
    if let Some(sections) = memo["sections"].as_array_mut() {
        for section in sections.iter_mut() {
            let key = section["key"].as_str().unwrap_or("?").to_string();

            for citation in section["citations"].as_array().into_iter().flatten() {
                if let Some(token) = citation.as_str()
                    && !exact_citation_re().is_match(token)
                {
                    report.warnings.push(ValidationIssue::new(
                        "invalid_citation_format",
                        format!("bad citation in {key}: '{token}'"),
                    ));
                }
            }

            if let Some(confidence) = section.get("confidence")
                && !confidence.is_null()
            {
                match confidence.as_f64() {
                    Some(value) if (0.0..=1.0).contains(&value) => {}
                    Some(value) => {
                        report.warnings.push(ValidationIssue::new(
                            "confidence_out_of_range",
                            format!("confidence {value} in '{key}' clamped to 0-1"),
                        ));
                        let clamped = value.clamp(0.0, 1.0);
                        if let Some(number) = serde_json::Number::from_f64(clamped) {
                            section["confidence"] = Value::Number(number);
                        }
                    }
                    None => {
                        report.warnings.push(ValidationIssue::new(
                            "confidence_not_numeric",
                            format!("confidence in '{key}' is not numeric"),
                        ));
                        section["confidence"] = Value::Null;
                    }
                }
            }

            let word_count = section["content"]
                .as_str()
                .map_or(0, |c| c.split_whitespace().count());
            if word_count > 200 {
                report.warnings.push(ValidationIssue::new(
                    "content_too_long",
                    format!("'{key}': {word_count} words (target 100-150)"),
                ));
            }
        }
    }

    // 4. Currency consistency between top level and financials mirror
    let top_currency = memo["currency"].as_str().map(str::to_string);
    if let (Some(top), Some(nested)) = (
        top_currency.as_deref(),
        memo["financials"]["currency"].as_str(),
    ) && top != nested
    {
        report.errors.push(ValidationIssue::new(
            "currency_mismatch",
            format!("financials.currency='{nested}' != top-level '{top}'"),
        ));
    }
    if let Some(top) = top_currency.as_deref()
        && top != "UNKNOWN"
        && (top.len() != 3 || !top.chars().all(|c| c.is_ascii_uppercase()))
    {
        report.errors.push(ValidationIssue::new(
            "invalid_currency",
            format!("currency '{top}' is not a 3-letter code or UNKNOWN"),
        ));
    }

    // 5. Enum vocabularies
    let severities = ["High", "Medium", "Low"];
    for (index, risk) in memo["risks"].as_array().into_iter().flatten().enumerate() {
        let severity = risk["severity"].as_str().unwrap_or("");
        if !severities.contains(&severity) {
            report.errors.push(ValidationIssue::new(
                "invalid_severity",
                format!("risks[{index}].severity='{severity}' not in High|Medium|Low"),
            ));
        }
    }
    for (index, opp) in memo["opportunities"].as_array().into_iter().flatten().enumerate() {
        let impact = opp["impact"].as_str().unwrap_or("");
        if !severities.contains(&impact) {
            report.errors.push(ValidationIssue::new(
                "invalid_impact",
                format!("opportunities[{index}].impact='{impact}' not in High|Medium|Low"),
            ));
        }
    }
    let esg_statuses = ["Positive", "Neutral", "Negative"];
    for (index, factor) in memo["esg"]["factors"].as_array().into_iter().flatten().enumerate() {
        let status = factor["status"].as_str().unwrap_or("");
        if !esg_statuses.contains(&status) {
            report.errors.push(ValidationIssue::new(
                "invalid_esg_status",
                format!("esg.factors[{index}].status='{status}' not in Positive|Neutral|Negative"),
            ));
        }
    }

    // 6. FinancialYear.revenue parses as a number; year is plausible
    for (index, year_data) in memo["financials"]["historical"]
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
    {
        if let Some(revenue) = year_data.get("revenue")
            && !revenue.is_number()
        {
            let text = revenue.as_str().unwrap_or_default();
            if coerce_numeric(text).is_none() {
                report.warnings.push(ValidationIssue::new(
                    "unparseable_revenue",
                    format!("historical[{index}].revenue='{text}' not parseable as number"),
                ));
            }
        }
        let year = year_data["year"].as_i64().unwrap_or(0);
        if !(2000..=2030).contains(&year) {
            report.warnings.push(ValidationIssue::new(
                "invalid_year",
                format!("historical[{index}].year='{year}' not a valid year (2000-2030)"),
            ));
        }
    }

    // 7. meta.version is forced to 2
    if memo["meta"]["version"].as_i64() != Some(2) {
        report.warnings.push(ValidationIssue::new(
            "invalid_meta_version",
            format!("meta.version={}, expected 2", memo["meta"]["version"]),
        ));
        memo["meta"]["version"] = Value::from(2);
    }

    // 8. next_steps structure
    for (index, step) in memo["next_steps"].as_array().into_iter().flatten().enumerate() {
        for field in ["priority", "action", "owner"] {
            if step.get(field).is_none() {
                report.warnings.push(ValidationIssue::new(
                    "missing_next_step_field",
                    format!("next_steps[{index}] missing '{field}'"),
                ));
            }
        }
    }

    report
}
