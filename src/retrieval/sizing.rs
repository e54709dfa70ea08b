//! Query types and query-adaptive retrieval sizing.

use serde::{Deserialize, Serialize};

/// Query intent produced by the cheap LLM classification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Pull specific figures out of the documents.
    DataExtraction,
    /// Summarize a topic or section.
    Summarization,
    /// Look up a named entity.
    EntityLookup,
    /// Everything else.
    GeneralQa,
    /// Compare content across documents.
    Comparison,
}

impl Default for QueryType {
    fn default() -> Self {
        Self::GeneralQa
    }
}

/// Output of the query-understanding step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryUnderstanding {
    /// Detected query type.
    #[serde(default)]
    pub query_type: QueryType,
    /// Query reformulated for keyword matching.
    pub reformulated_query: String,
    /// Entities mentioned in the query (document names, companies).
    #[serde(default)]
    pub entities: Vec<String>,
    /// Classifier confidence (0-1); `None` when the classifier was skipped.
    #[serde(default)]
    pub confidence: Option<f32>,
    /// HyDE hypothetical answer for dense retrieval, when produced.
    #[serde(default)]
    pub hypothetical_answer: Option<String>,
}

impl QueryUnderstanding {
    /// Fallback understanding when classification fails: the raw query with
    /// generic sizing.
    #[must_use]
    pub fn passthrough(query: &str) -> Self {
        Self {
            query_type: QueryType::GeneralQa,
            reformulated_query: query.to_string(),
            entities: Vec::new(),
            confidence: None,
            hypothetical_answer: None,
        }
    }

    /// Whether the classification is confident enough to drive adaptive
    /// sizing. Unknown confidence counts as confident (the classifier was
    /// deliberate); low confidence falls back to generic sizing.
    #[must_use]
    pub fn is_confident(&self) -> bool {
        self.confidence.is_none_or(|c| c >= 0.4)
    }
}

/// Resolved retrieval sizes for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalSizing {
    /// Candidate pool retrieved before re-ranking.
    pub candidates: usize,
    /// Final chunk count after re-ranking.
    pub final_top_k: usize,
    /// Maximum linked chunks fetched per expanded chunk.
    pub max_expansion_per_chunk: usize,
    /// Hard cap on total chunks after expansion.
    pub max_total_after_expansion: usize,
}

impl RetrievalSizing {
    /// Resolves sizing from the query type, starting from configured
    /// defaults. Low-confidence classifications keep the defaults.
    #[must_use]
    pub fn resolve(
        understanding: &QueryUnderstanding,
        default_candidates: usize,
        default_top_k: usize,
    ) -> Self {
        let (candidates, final_top_k) = if understanding.is_confident() {
            match understanding.query_type {
                QueryType::DataExtraction => {
                    (default_candidates.max(25), default_top_k.max(12))
                }
                QueryType::Summarization => (
                    default_candidates.clamp(15, 20),
                    default_top_k.clamp(8, 10),
                ),
                QueryType::EntityLookup => (
                    default_candidates.clamp(12, 20),
                    default_top_k.clamp(6, 10),
                ),
                QueryType::GeneralQa | QueryType::Comparison => {
                    (default_candidates, default_top_k)
                }
            }
        } else {
            (default_candidates, default_top_k)
        };

        Self {
            candidates,
            final_top_k,
            max_expansion_per_chunk: max_expansion(understanding.query_type),
            max_total_after_expansion: max_total(understanding.query_type),
        }
    }
}

/// Max linked chunks fetched per expanded chunk, by query type.
#[must_use]
pub const fn max_expansion(query_type: QueryType) -> usize {
    match query_type {
        QueryType::DataExtraction | QueryType::Comparison => 2,
        QueryType::Summarization | QueryType::EntityLookup | QueryType::GeneralQa => 1,
    }
}

/// Hard cap on total chunks after expansion, by query type.
#[must_use]
pub const fn max_total(query_type: QueryType) -> usize {
    match query_type {
        QueryType::DataExtraction => 24,
        QueryType::Summarization => 15,
        QueryType::EntityLookup => 10,
        QueryType::GeneralQa => 18,
        QueryType::Comparison => 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn understanding(query_type: QueryType, confidence: Option<f32>) -> QueryUnderstanding {
        QueryUnderstanding {
            query_type,
            reformulated_query: "q".to_string(),
            entities: Vec::new(),
            confidence,
            hypothetical_answer: None,
        }
    }

    #[test_case(QueryType::DataExtraction, 25, 12, 2, 24; "data extraction")]
    #[test_case(QueryType::Summarization, 20, 10, 1, 15; "summarization")]
    #[test_case(QueryType::EntityLookup, 20, 10, 1, 10; "entity lookup")]
    #[test_case(QueryType::GeneralQa, 20, 10, 1, 18; "general qa")]
    #[test_case(QueryType::Comparison, 20, 10, 2, 20; "comparison")]
    fn test_sizing_table(
        query_type: QueryType,
        candidates: usize,
        top_k: usize,
        expansion: usize,
        total: usize,
    ) {
        let sizing = RetrievalSizing::resolve(&understanding(query_type, Some(0.9)), 20, 10);
        assert_eq!(sizing.candidates, candidates);
        assert_eq!(sizing.final_top_k, top_k);
        assert_eq!(sizing.max_expansion_per_chunk, expansion);
        assert_eq!(sizing.max_total_after_expansion, total);
    }

    #[test]
    fn test_low_confidence_uses_defaults() {
        let sizing =
            RetrievalSizing::resolve(&understanding(QueryType::DataExtraction, Some(0.2)), 20, 10);
        assert_eq!(sizing.candidates, 20);
        assert_eq!(sizing.final_top_k, 10);
        // Expansion caps still follow the detected type
        assert_eq!(sizing.max_expansion_per_chunk, 2);
    }

    #[test]
    fn test_unknown_confidence_counts_as_confident() {
        let sizing =
            RetrievalSizing::resolve(&understanding(QueryType::DataExtraction, None), 20, 10);
        assert_eq!(sizing.candidates, 25);
        assert_eq!(sizing.final_top_k, 12);
    }

    #[test]
    fn test_summarization_clamps_small_defaults_up() {
        let sizing =
            RetrievalSizing::resolve(&understanding(QueryType::Summarization, Some(0.8)), 10, 5);
        assert_eq!(sizing.candidates, 15);
        assert_eq!(sizing.final_top_k, 8);
    }

    #[test]
    fn test_passthrough() {
        let u = QueryUnderstanding::passthrough("what is the cap rate?");
        assert_eq!(u.query_type, QueryType::GeneralQa);
        assert_eq!(u.reformulated_query, "what is the cap rate?");
        assert!(u.is_confident());
    }
}
