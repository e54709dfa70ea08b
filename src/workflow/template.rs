//! Built-in workflow template definitions.
//!
//! Templates are versioned, typed job definitions. The flagship Investment
//! Memo template produces a decision-ready memo with structured sections;
//! Red Flag Analysis is a smaller diligence screen. Both ship with their
//! retrieval specs and output schemas.

use serde_json::json;

use crate::core::{SectionSpec, VariableSpec, VariableType, WorkflowTemplate};

/// Section keys every completed Investment Memo must contain.
pub const MEMO_REQUIRED_SECTIONS: &[&str] = &[
    "executive_overview",
    "company_overview",
    "market_competition",
    "financial_performance",
    "track_record_value_creation",
    "risks",
    "opportunities",
    "management_culture",
    "esg_snapshot",
    "valuation_scenarios",
    "next_steps",
    "inconsistencies",
];

/// Builds the Investment Memo template (version 2).
#[must_use]
pub fn investment_memo_template() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "builtin-investment-memo-v2".to_string(),
        name: "Investment Memo".to_string(),
        domain: "private_equity".to_string(),
        variables: vec![
            string_var("company_name"),
            VariableSpec {
                name: "target_audience".to_string(),
                var_type: VariableType::Enum,
                default: None,
                min: None,
                choices: vec![
                    "Investment Committee".to_string(),
                    "Limited Partners".to_string(),
                    "Deal Team".to_string(),
                ],
            },
            bool_var("include_financials", true),
            bool_var("focus_risks", false),
            bool_var("include_esg", true),
            bool_var("include_management_culture", true),
            bool_var("include_valuation", true),
            bool_var("include_scenarios", true),
        ],
        output_schema: memo_output_schema(),
        retrieval_spec: memo_retrieval_spec(),
        min_documents: 1,
        max_documents: 5,
        version: 2,
        active: true,
    }
}

/// Builds the Red Flag Analysis template (version 1).
#[must_use]
pub fn red_flags_template() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "builtin-red-flags-v1".to_string(),
        name: "Red Flag Analysis".to_string(),
        domain: "private_equity".to_string(),
        variables: vec![string_var("company_name")],
        output_schema: json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["red_flags", "references", "meta"],
            "properties": {
                "red_flags": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["description", "category", "severity", "citations"],
                        "properties": {
                            "description": {"type": "string"},
                            "category": {"type": "string"},
                            "severity": {"type": "string"},
                            "citations": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                },
                "references": {"type": "array", "items": {"type": "string"}},
                "meta": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["version"],
                    "properties": {"version": {"type": "integer"}}
                }
            }
        }),
        retrieval_spec: vec![
            SectionSpec {
                key: "risks".to_string(),
                title: "RISKS".to_string(),
                queries: vec![
                    "risk factors".to_string(),
                    "litigation regulatory issues".to_string(),
                    "customer concentration".to_string(),
                    "debt covenants leverage".to_string(),
                ],
                prefer_tables: false,
                max_chunks: 20,
                priority: 1,
            },
            SectionSpec {
                key: "financial".to_string(),
                title: "FINANCIAL ANOMALIES".to_string(),
                queries: vec![
                    "declining revenue".to_string(),
                    "margin compression".to_string(),
                    "one-time adjustments addbacks".to_string(),
                ],
                prefer_tables: true,
                max_chunks: 15,
                priority: 2,
            },
        ],
        min_documents: 1,
        max_documents: 3,
        version: 1,
        active: true,
    }
}

/// Retrieval spec for the Investment Memo.
fn memo_retrieval_spec() -> Vec<SectionSpec> {
    let section = |key: &str,
                   title: &str,
                   queries: &[&str],
                   prefer_tables: bool,
                   max_chunks: usize,
                   priority: u32| SectionSpec {
        key: key.to_string(),
        title: title.to_string(),
        queries: queries.iter().map(|q| (*q).to_string()).collect(),
        prefer_tables,
        max_chunks,
        priority,
    };

    vec![
        section(
            "executive",
            "EXECUTIVE OVERVIEW",
            &["investment highlights", "key strengths", "business overview"],
            false,
            15,
            1,
        ),
        section(
            "market",
            "MARKET & COMPETITION",
            &["market size", "competitive landscape", "growth drivers", "competition"],
            false,
            15,
            2,
        ),
        section(
            "financial",
            "FINANCIAL HIGHLIGHTS",
            &["revenue growth", "ebitda margin", "financial performance", "profitability"],
            true,
            20,
            3,
        ),
        section(
            "management",
            "MANAGEMENT & ORGANIZATION",
            &["management team", "leadership experience", "organization"],
            false,
            10,
            4,
        ),
        section(
            "risks",
            "RISKS",
            &["risk factors", "customer concentration", "regulatory risk", "operational risk"],
            false,
            15,
            5,
        ),
        section(
            "actions",
            "RECOMMENDED ACTIONS",
            &["recommended actions", "follow-up diligence", "next steps"],
            false,
            10,
            6,
        ),
    ]
}

/// Output schema for the Investment Memo (the structured-output contract).
fn memo_output_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["currency", "sections", "risks", "opportunities", "next_steps",
                     "inconsistencies", "references", "meta"],
        "properties": {
            "currency": {
                "type": "string",
                "description": "3-letter ISO code or UNKNOWN"
            },
            "sections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["key", "title", "content", "citations"],
                    "properties": {
                        "key": {"type": "string"},
                        "title": {"type": "string"},
                        "content": {"type": "string"},
                        "citations": {"type": "array", "items": {"type": "string"}},
                        "confidence": {"type": ["number", "null"]}
                    }
                }
            },
            "company_overview": {"type": ["object", "null"]},
            "financials": {"type": ["object", "null"]},
            "valuation": {"type": ["object", "null"]},
            "management": {"type": ["object", "null"]},
            "esg": {"type": ["object", "null"]},
            "risks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["description", "category", "severity", "citations"],
                    "properties": {
                        "description": {"type": "string"},
                        "category": {"type": "string"},
                        "severity": {"type": "string"},
                        "citations": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "opportunities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["description", "category", "impact", "citations"],
                    "properties": {
                        "description": {"type": "string"},
                        "category": {"type": "string"},
                        "impact": {"type": "string"},
                        "citations": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "next_steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["priority", "action", "owner"],
                    "properties": {
                        "priority": {"type": "integer"},
                        "action": {"type": "string"},
                        "owner": {"type": "string"},
                        "timeline_days": {"type": ["integer", "null"]}
                    }
                }
            },
            "inconsistencies": {"type": "array", "items": {"type": "string"}},
            "references": {"type": "array", "items": {"type": "string"}},
            "meta": {
                "type": "object",
                "additionalProperties": false,
                "required": ["version"],
                "properties": {"version": {"type": "integer"}}
            }
        }
    })
}

fn string_var(name: &str) -> VariableSpec {
    VariableSpec {
        name: name.to_string(),
        var_type: VariableType::String,
        default: None,
        min: None,
        choices: Vec::new(),
    }
}

fn bool_var(name: &str, default: bool) -> VariableSpec {
    VariableSpec {
        name: name.to_string(),
        var_type: VariableType::Boolean,
        default: Some(serde_json::Value::Bool(default)),
        min: None,
        choices: Vec::new(),
    }
}
