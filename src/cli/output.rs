//! CLI output formatting.

// The CLI is the one place that prints
#![allow(clippy::print_stdout)]

use serde::Serialize;

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON lines.
    Json,
}

impl OutputFormat {
    /// Parses the `--format` flag value; unknown values fall back to text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Prints a serializable record in the selected format. Text mode renders
/// top-level fields as `key: value` lines.
pub fn print_record<T: Serialize>(format: OutputFormat, record: &T) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
        }
        OutputFormat::Text => {
            let value = serde_json::to_value(record).unwrap_or_default();
            if let Some(map) = value.as_object() {
                for (key, field) in map {
                    match field {
                        serde_json::Value::String(s) => println!("{key}: {s}"),
                        other => println!("{key}: {other}"),
                    }
                }
            } else {
                println!("{value}");
            }
        }
    }
}

/// Prints a plain line (text mode) or a JSON message object (json mode).
pub fn print_line(format: OutputFormat, line: &str) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "message": line }));
        }
        OutputFormat::Text => println!("{line}"),
    }
}

/// Prints a section heading in text mode; no-op in json mode.
pub fn print_heading(format: OutputFormat, heading: &str) {
    if format == OutputFormat::Text {
        println!("\n=== {heading} ===");
    }
}
