//! Per-model cost accounting.

/// Pricing per million tokens, matched by model-id prefix.
/// Longest matching prefix wins.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    // (prefix, input USD/Mtok, output USD/Mtok)
    ("gpt-5.2", 1.25, 10.0),
    ("gpt-5-mini", 0.25, 2.0),
    ("gpt-5", 1.25, 10.0),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.0, 8.0),
];

/// Computes the USD cost of a call, or `None` for unknown models.
#[must_use]
pub fn compute_cost(model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    let (_, input_price, output_price) = MODEL_PRICING
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())?;

    #[allow(clippy::cast_precision_loss)]
    let cost = (input_tokens as f64).mul_add(
        input_price / 1_000_000.0,
        (output_tokens as f64) * (output_price / 1_000_000.0),
    );
    Some(cost)
}
