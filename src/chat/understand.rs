//! LLM-powered query understanding.
//!
//! A single cheap classification call produces the query type, a
//! reformulated query for keyword matching, mentioned entities, a
//! confidence score, and (for retrieval-heavy intents) a HyDE hypothetical
//! answer. A failed or malformed classification falls back to a
//! passthrough understanding with generic sizing.

use crate::error::Result;
use crate::llm::LlmClient;
use crate::retrieval::QueryUnderstanding;

/// Query understanding service.
pub struct QueryUnderstandingService<'a> {
    llm: &'a LlmClient,
}

impl<'a> QueryUnderstandingService<'a> {
    /// Creates the service over an LLM client.
    #[must_use]
    pub const fn new(llm: &'a LlmClient) -> Self {
        Self { llm }
    }

    /// Classifies a query against the session's document filenames.
    ///
    /// # Errors
    ///
    /// Never fails outward: classification errors degrade to a
    /// passthrough understanding.
    pub async fn understand(
        &self,
        query: &str,
        document_filenames: &[String],
    ) -> Result<QueryUnderstanding> {
        let doc_list = if document_filenames.is_empty() {
            "none".to_string()
        } else {
            document_filenames.join(", ")
        };

        let prompt = format!(
            r#"Classify this document-analysis query.

Query: {query}
Attached documents: {doc_list}

Return JSON:
{{
  "query_type": "data_extraction" | "summarization" | "entity_lookup" | "general_qa" | "comparison",
  "reformulated_query": "keyword-dense rewrite of the query",
  "entities": ["names of documents, companies, or deals mentioned"],
  "confidence": 0.0-1.0,
  "hypothetical_answer": "one-paragraph plausible answer to embed for retrieval, or null"
}}"#
        );

        match self.llm.cheap_json(None, &prompt).await {
            Ok(extraction) => {
                let mut understanding: QueryUnderstanding =
                    serde_json::from_value(extraction.parsed).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "query understanding malformed, using passthrough");
                        QueryUnderstanding::passthrough(query)
                    });
                if understanding.reformulated_query.trim().is_empty() {
                    understanding.reformulated_query = query.to_string();
                }
                tracing::debug!(
                    query_type = ?understanding.query_type,
                    confidence = ?understanding.confidence,
                    entities = understanding.entities.len(),
                    "query understood"
                );
                Ok(understanding)
            }
            Err(e) => {
                tracing::warn!(error = %e, "query understanding failed, using passthrough");
                Ok(QueryUnderstanding::passthrough(query))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::retrieval::{QueryType, QueryUnderstanding};

    #[test]
    fn test_understanding_deserializes_from_classifier_shape() {
        let parsed: QueryUnderstanding = serde_json::from_value(serde_json::json!({
            "query_type": "comparison",
            "reformulated_query": "cap rate Sunset Plaza Ocean View Highland Tower",
            "entities": ["Sunset Plaza", "Ocean View", "Highland Tower"],
            "confidence": 0.92,
            "hypothetical_answer": null
        }))
        .unwrap();
        assert_eq!(parsed.query_type, QueryType::Comparison);
        assert_eq!(parsed.entities.len(), 3);
        assert!(parsed.is_confident());
    }

    #[test]
    fn test_unknown_type_falls_back_via_default() {
        // Malformed payload fails deserialization and callers fall back to
        // passthrough; a missing type alone defaults to general_qa.
        let parsed: QueryUnderstanding = serde_json::from_value(serde_json::json!({
            "reformulated_query": "revenue"
        }))
        .unwrap();
        assert_eq!(parsed.query_type, QueryType::GeneralQa);
    }
}
