//! Document matcher: maps LLM-extracted entities to session documents.

/// Returns ids of documents whose filename contains any of the entities,
/// case-insensitive after normalization (non-alphanumerics collapse to
/// spaces). Order follows the document list; each document matches once.
#[must_use]
pub fn match_entities_to_documents(
    entities: &[String],
    documents: &[(String, String)],
) -> Vec<String> {
    let normalized_entities: Vec<String> = entities
        .iter()
        .map(|e| normalize(e))
        .filter(|e| !e.is_empty())
        .collect();
    if normalized_entities.is_empty() {
        return Vec::new();
    }

    documents
        .iter()
        .filter(|(_, filename)| {
            let name = normalize(filename);
            normalized_entities.iter().any(|entity| name.contains(entity))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn normalize(text: &str) -> String {
    let collapsed: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapsed.split_whitespace().collect::<Vec<_>>().join(" ")
}
