//! Normalization of loose LLM output into the typed artifact shape.
//!
//! Maps common model quirks into the contract before validation: nulls are
//! omitted, unit-suffixed numeric strings become raw numbers, percentage
//! strings become the units the schema demands, comma-joined strings become
//! lists, and required-but-missing inner fields are inferred when safe
//! (never guessed values). Normalization is a fixed point: applying it to
//! already-normalized output changes nothing.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Fields whose values are citation-token lists; strings get split here.
const LIST_FIELDS: &[&str] = &["citations", "references"];

/// Year-map fields under `financials` whose null entries are dropped.
const FINANCIAL_YEAR_MAPS: &[&str] = &[
    "revenue_by_year",
    "ebitda_by_year",
    "adjusted_ebitda_by_year",
    "net_income_by_year",
    "gross_margin_by_year",
    "capex_by_year",
    "fcf_by_year",
];

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\$?\s*(-?[\d,]+(?:\.\d+)?)\s*([KMBkmb]|[Xx]|%)?$").unwrap()
    })
}

/// Parses a numeric string with optional `$`/comma formatting and a unit
/// suffix: `15.2M` → 15 200 000, `1.5x` → 1.5, `15%` → 0.15.
#[must_use]
pub fn coerce_numeric(text: &str) -> Option<f64> {
    let caps = numeric_re().captures(text.trim())?;
    let raw: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let scaled = match caps.get(2).map(|m| m.as_str()) {
        Some("K" | "k") => raw * 1_000.0,
        Some("M" | "m") => raw * 1_000_000.0,
        Some("B" | "b") => raw * 1_000_000_000.0,
        Some("%") => raw / 100.0,
        Some("X" | "x") | None => raw,
        Some(_) => return None,
    };
    Some(scaled)
}

/// Coerces a percentage value to decimal form (0.405) regardless of
/// whether the model produced `40.5`, `"40.5%"`, or `0.405`.
#[must_use]
pub fn coerce_percentage_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            // Whole-number percentages above 1.5 are read as percent points
            Some(if n > 1.5 { n / 100.0 } else { n })
        }
        Value::String(s) => {
            let parsed = coerce_numeric(s)?;
            Some(if s.contains('%') || parsed <= 1.5 {
                parsed
            } else {
                parsed / 100.0
            })
        }
        _ => None,
    }
}

/// Normalizes a raw LLM artifact in place and returns it.
///
/// Idempotent: a second application is a no-op.
#[must_use]
pub fn normalize_output(value: Value) -> Value {
    let mut value = normalize_value(value);
    if let Some(object) = value.as_object_mut() {
        normalize_sections(object);
        normalize_string_items(object, "risks", "description");
        normalize_string_items(object, "opportunities", "description");
        if let Some(financials) = object.get_mut("financials") {
            normalize_financials(financials);
        }
    }
    value
}

/// Structural pass: drop nulls, recurse containers, split list fields.
fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                if item.is_null() {
                    continue;
                }
                let item = if LIST_FIELDS.contains(&key.as_str()) {
                    split_to_list(item)
                } else {
                    item
                };
                out.insert(key, normalize_value(item));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(normalize_value)
                .collect(),
        ),
        primitive => primitive,
    }
}

/// Comma-joined citation strings become lists.
fn split_to_list(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Array(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        ),
        other => other,
    }
}

/// A `sections` value arriving as a string array becomes objects with
/// slugified keys and a visible placeholder for content.
fn normalize_sections(object: &mut serde_json::Map<String, Value>) {
    let Some(sections) = object.get("sections") else {
        return;
    };

    let all_strings = sections
        .as_array()
        .is_some_and(|a| !a.is_empty() && a.iter().all(Value::is_string));
    if !all_strings {
        return;
    }

    tracing::warn!("normalizer: converting sections from string array to object array");
    let converted: Vec<Value> = sections
        .as_array()
        .map(|titles| {
            titles
                .iter()
                .filter_map(Value::as_str)
                .map(|title| {
                    serde_json::json!({
                        "key": slugify(title),
                        "title": title,
                        "content": "[Content not generated]",
                        "citations": []
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    object.insert("sections".to_string(), Value::Array(converted));
}

/// Bare strings in object arrays become `{field: string}` entries.
fn normalize_string_items(
    object: &mut serde_json::Map<String, Value>,
    key: &str,
    field: &str,
) {
    let Some(items) = object.get_mut(key).and_then(Value::as_array_mut) else {
        return;
    };
    for item in items.iter_mut() {
        if let Value::String(text) = item {
            let text = text.trim().to_string();
            if !text.is_empty() {
                *item = serde_json::json!({ field: text });
            }
        }
    }
    items.retain(|item| !matches!(item, Value::String(s) if s.trim().is_empty()));
}

/// Financials pass: coerce unit-suffixed figures and percentage margins;
/// drop null year-map entries.
fn normalize_financials(financials: &mut Value) {
    let Some(map) = financials.as_object_mut() else {
        return;
    };

    for field in FINANCIAL_YEAR_MAPS {
        if let Some(year_map) = map.get_mut(*field).and_then(Value::as_object_mut) {
            year_map.retain(|_, v| !v.is_null());
            for entry in year_map.values_mut() {
                coerce_in_place(entry);
            }
        }
    }

    if let Some(historical) = map.get_mut("historical").and_then(Value::as_array_mut) {
        for year in historical.iter_mut() {
            let Some(year_map) = year.as_object_mut() else { continue };
            for field in ["revenue", "ebitda"] {
                if let Some(entry) = year_map.get_mut(field) {
                    coerce_in_place(entry);
                }
            }
            if let Some(margin) = year_map.get("margin").cloned()
                && let Some(decimal) = coerce_percentage_decimal(&margin)
                && let Some(number) = serde_json::Number::from_f64(decimal)
            {
                year_map.insert("margin".to_string(), Value::Number(number));
            }
        }
    }

    if let Some(metrics) = map.get_mut("metrics").and_then(Value::as_object_mut) {
        for field in ["rev_cagr", "ebitda_margin_latest"] {
            if let Some(entry) = metrics.get(field).cloned()
                && let Some(decimal) = coerce_percentage_decimal(&entry)
                && let Some(number) = serde_json::Number::from_f64(decimal)
            {
                metrics.insert(field.to_string(), Value::Number(number));
            }
        }
    }
}

/// Replaces a unit-suffixed numeric string with its raw number.
fn coerce_in_place(entry: &mut Value) {
    if let Value::String(s) = entry
        && let Some(parsed) = coerce_numeric(s)
        && let Some(number) = serde_json::Number::from_f64(parsed)
    {
        *entry = Value::Number(number);
    }
}

fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .replace('&', "and")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("15.2M", 15_200_000.0; "millions")]
    #[test_case("$111.9M", 111_900_000.0; "dollar millions")]
    #[test_case("1.2B", 1_200_000_000.0; "billions")]
    #[test_case("450K", 450_000.0; "thousands")]
    #[test_case("1.5x", 1.5; "multiple")]
    #[test_case("15%", 0.15; "percent")]
    #[test_case("1,234,567", 1_234_567.0; "comma grouping")]
    #[test_case("-3.5M", -3_500_000.0; "negative")]
    fn test_coerce_numeric(input: &str, expected: f64) {
        let parsed = coerce_numeric(input).unwrap();
        assert!((parsed - expected).abs() < 1e-6, "{input}: {parsed}");
    }

    #[test]
    fn test_coerce_numeric_rejects_prose() {
        assert!(coerce_numeric("approximately twelve").is_none());
        assert!(coerce_numeric("").is_none());
    }

    #[test]
    fn test_percentage_decimal_coercion() {
        assert!((coerce_percentage_decimal(&serde_json::json!(40.5)).unwrap() - 0.405).abs() < 1e-9);
        assert!((coerce_percentage_decimal(&serde_json::json!(0.405)).unwrap() - 0.405).abs() < 1e-9);
        assert!(
            (coerce_percentage_decimal(&serde_json::json!("40.5%")).unwrap() - 0.405).abs() < 1e-9
        );
    }

    #[test]
    fn test_nulls_omitted() {
        let normalized = normalize_output(serde_json::json!({
            "currency": "USD",
            "valuation": null,
            "sections": [{"key": "risks", "title": "Risks", "content": "x", "citations": [], "confidence": null}],
            "risks": [null],
        }));
        assert!(normalized.get("valuation").is_none());
        assert!(normalized["sections"][0].get("confidence").is_none());
        assert_eq!(normalized["risks"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_comma_joined_references_become_list() {
        let normalized = normalize_output(serde_json::json!({
            "references": "[D1:p2], [D2:p3]"
        }));
        assert_eq!(normalized["references"][0], "[D1:p2]");
        assert_eq!(normalized["references"][1], "[D2:p3]");
    }

    #[test]
    fn test_sections_string_array_converted() {
        let normalized = normalize_output(serde_json::json!({
            "sections": ["Executive Overview", "Market & Competition"]
        }));
        assert_eq!(normalized["sections"][0]["key"], "executive_overview");
        assert_eq!(normalized["sections"][1]["key"], "market_and_competition");
        assert_eq!(normalized["sections"][0]["content"], "[Content not generated]");
    }

    #[test]
    fn test_risk_strings_wrapped() {
        let normalized = normalize_output(serde_json::json!({
            "risks": ["Customer concentration", ""]
        }));
        assert_eq!(normalized["risks"][0]["description"], "Customer concentration");
        assert_eq!(normalized["risks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_financials_coerced() {
        let normalized = normalize_output(serde_json::json!({
            "financials": {
                "historical": [
                    {"year": 2023, "revenue": "111.9M", "ebitda": "45.3M", "margin": "40.5%"}
                ],
                "revenue_by_year": {"2022": "98.7M", "2023": null},
                "metrics": {"rev_cagr": 25}
            }
        }));
        let hist = &normalized["financials"]["historical"][0];
        assert_eq!(hist["revenue"], 111_900_000.0);
        assert!((hist["margin"].as_f64().unwrap() - 0.405).abs() < 1e-9);
        assert!(normalized["financials"]["revenue_by_year"].get("2023").is_none());
        assert!(
            (normalized["financials"]["metrics"]["rev_cagr"].as_f64().unwrap() - 0.25).abs() < 1e-9
        );
    }

    #[test]
    fn test_normalization_idempotent() {
        let raw = serde_json::json!({
            "currency": "USD",
            "sections": ["Executive Overview"],
            "references": "[D1:p2], [D2:p3]",
            "risks": ["Leverage"],
            "financials": {
                "historical": [{"year": 2023, "revenue": "12M", "margin": "40%"}]
            }
        });
        let once = normalize_output(raw);
        let twice = normalize_output(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Market & Competition"), "market_and_competition");
        assert_eq!(slugify("Executive Overview"), "executive_overview");
        assert_eq!(slugify("ESG / Sustainability"), "esg_sustainability");
    }
}
