//! Query-biased compression of narrative chunks.
//!
//! Oversized narrative chunks are compressed before cross-encoder scoring
//! and before direct-mode context assembly by extracting the sentences
//! closest to the query. Table and key-value chunks are never compressed;
//! their full content is preserved.

use std::collections::HashSet;

use unicode_segmentation::UnicodeSegmentation;

use crate::chunking::split_sentences;
use crate::core::estimate_tokens;

/// Token count above which a narrative chunk gets compressed.
pub const COMPRESS_THRESHOLD_TOKENS: usize = 200;

/// Target token budget for the compressed text.
pub const COMPRESS_TARGET_TOKENS: usize = 120;

/// Compresses narrative text to its most query-relevant sentences.
///
/// Returns `None` when the text is already within the threshold (no
/// compression needed). Selected sentences keep their original order.
#[must_use]
pub fn compress_for_query(query: &str, text: &str) -> Option<String> {
    if estimate_tokens(text) <= COMPRESS_THRESHOLD_TOKENS {
        return None;
    }

    let sentences = split_sentences(text);
    if sentences.len() <= 1 {
        return None;
    }

    let query_tokens = word_set(query);

    // Score each sentence by query-term overlap; earlier sentences win ties
    // so headers and topic sentences survive.
    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, sentence)| {
            let tokens = word_set(sentence);
            let overlap = tokens.intersection(&query_tokens).count();
            #[allow(clippy::cast_precision_loss)]
            let score = overlap as f64 + 1.0 / (i + 2) as f64;
            (i, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<usize> = Vec::new();
    let mut tokens_used = 0usize;
    for (index, _) in scored {
        let sentence_tokens = estimate_tokens(sentences[index]);
        if tokens_used + sentence_tokens > COMPRESS_TARGET_TOKENS && !selected.is_empty() {
            continue;
        }
        selected.push(index);
        tokens_used += sentence_tokens;
        if tokens_used >= COMPRESS_TARGET_TOKENS {
            break;
        }
    }
    selected.sort_unstable();

    let compressed = selected
        .into_iter()
        .map(|i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ");
    Some(compressed)
}

fn word_set(text: &str) -> HashSet<String> {
    text.unicode_words()
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_not_compressed() {
        assert!(compress_for_query("revenue", "Revenue was $12M.").is_none());
    }

    #[test]
    fn test_long_text_compressed_to_relevant_sentences() {
        let filler = "Unrelated filler sentence about something else entirely. ".repeat(30);
        let text = format!("{filler}The cap rate for the property is 5.2 percent. {filler}");
        let compressed = compress_for_query("what is the cap rate", &text).unwrap();
        assert!(compressed.contains("cap rate"));
        assert!(estimate_tokens(&compressed) <= COMPRESS_TARGET_TOKENS + 40);
        assert!(compressed.len() < text.len());
    }

    #[test]
    fn test_compression_preserves_sentence_order() {
        let text = format!(
            "Alpha metric first. {}Beta metric second. {}",
            "Filler text sentence here. ".repeat(20),
            "More filler text sentence. ".repeat(20)
        );
        let compressed = compress_for_query("alpha beta metric", &text).unwrap();
        let alpha_pos = compressed.find("Alpha").unwrap_or(usize::MAX);
        let beta_pos = compressed.find("Beta").unwrap_or(usize::MAX);
        assert!(alpha_pos < beta_pos);
    }

    #[test]
    fn test_single_sentence_not_compressed() {
        let text = "word ".repeat(900);
        assert!(compress_for_query("query", &text).is_none());
    }
}
