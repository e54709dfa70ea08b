//! JSON extraction and repair for LLM responses.
//!
//! Models occasionally wrap JSON in code fences, prepend explanatory text,
//! forget array brackets around citation lists, or get cut off mid-string.
//! This module extracts the JSON payload and fixes the common failure
//! shapes before parsing.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::LlmError;

fn citation_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#""citations":\s*"(\[D\d+:p\d+\])"(?:\s*,\s*"(?:\[D\d+:p\d+\])")*"#).unwrap()
    })
}

fn citation_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#""(\[D\d+:p\d+\])""#).unwrap()
    })
}

fn page_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\[([^\[\]]*\d+-\d+[^\[\]]*)\]").unwrap()
    })
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r",(\s*[}\]])").unwrap()
    })
}

fn missing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#""\s*\n\s*""#).unwrap()
    })
}

/// Extracts and parses JSON from an LLM response, repairing common issues
/// when the first parse fails.
///
/// # Errors
///
/// Returns [`LlmError::ResponseParse`] when no parsable JSON can be
/// recovered.
pub fn parse_json_response(response_text: &str) -> Result<serde_json::Value, LlmError> {
    let text = extract_json_payload(response_text);

    match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            tracing::warn!(error = %first_err, "JSON parse failed, attempting repair");
            let repaired = fix_common_json_errors(&text);
            serde_json::from_str(&repaired).map_err(|e| LlmError::ResponseParse {
                message: format!("after repair: {e} (original: {first_err})"),
            })
        }
    }
}

/// Strips code fences and explanatory preambles, returning the best JSON
/// candidate substring.
fn extract_json_payload(response_text: &str) -> String {
    let mut text = response_text.trim();

    // Fenced block takes priority
    if let Some(fenced) = text.split("```json").nth(1) {
        text = fenced.split("```").next().unwrap_or(fenced).trim();
    } else if text.contains("```") {
        let parts: Vec<&str> = text.split("```").collect();
        if parts.len() >= 2 {
            text = parts[1].trim();
        }
    }

    // Preamble before the first { or [ ("Here's the result: {...")
    if !text.starts_with('{') && !text.starts_with('[') {
        let obj = text.find('{').unwrap_or(text.len());
        let arr = text.find('[').unwrap_or(text.len());
        let start = obj.min(arr);
        if start < text.len() {
            text = &text[start..];
        }
    }

    text.to_string()
}

/// Attempts to fix common JSON formatting issues.
#[must_use]
pub fn fix_common_json_errors(text: &str) -> String {
    // Citations missing array brackets:
    // "citations": "[D1:p1]", "[D1:p3]" -> "citations": ["[D1:p1]", "[D1:p3]"]
    let mut text = citation_list_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let tokens: Vec<String> = citation_token_re()
                .captures_iter(caps.get(0).map_or("", |m| m.as_str()))
                .filter_map(|c| c.get(1).map(|m| format!("\"{}\"", m.as_str())))
                .collect();
            format!("\"citations\": [{}]", tokens.join(", "))
        })
        .into_owned();

    // Page ranges in arrays: [11, 54-70] -> [11, 54, 70]
    text = page_range_re()
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let inner = caps.get(1).map_or("", |m| m.as_str());
            static RANGE: OnceLock<Regex> = OnceLock::new();
            let range = RANGE.get_or_init(|| {
                #[allow(clippy::unwrap_used)]
                Regex::new(r"(\d+)-(\d+)").unwrap()
            });
            format!("[{}]", range.replace_all(inner, "$1, $2"))
        })
        .into_owned();

    // Trailing commas before closing braces/brackets
    text = trailing_comma_re().replace_all(&text, "$1").into_owned();

    // Missing commas between properties: "value"\n"key" -> "value",\n"key"
    text = missing_comma_re().replace_all(&text, "\",\n  \"").into_owned();

    // Truncated string at the end: odd quote count near the tail
    if text.matches('"').count() % 2 != 0 {
        if let Some(last_quote) = text.rfind('"')
            && last_quote > text.len().saturating_sub(50)
        {
            text.insert(last_quote + 1, '"');
        }
    }

    text
}
