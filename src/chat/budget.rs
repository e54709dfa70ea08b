//! Chat context budget enforcement.
//!
//! Trims the assembled context to fit the prompt budget: low-ranked chunks
//! drop first, then the conversation summary is truncated. The most recent
//! messages are never dropped.

use crate::core::ChatMessage;
use crate::retrieval::RetrievedChunk;

/// Default chat prompt budget in characters.
pub const DEFAULT_PROMPT_BUDGET_CHARS: usize = 60_000;

/// Budget enforcer for chat prompts.
#[derive(Debug, Clone, Copy)]
pub struct BudgetEnforcer {
    /// Character budget for the assembled prompt.
    pub budget_chars: usize,
}

impl Default for BudgetEnforcer {
    fn default() -> Self {
        Self {
            budget_chars: DEFAULT_PROMPT_BUDGET_CHARS,
        }
    }
}

impl BudgetEnforcer {
    /// Creates an enforcer with a custom budget.
    #[must_use]
    pub const fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    /// Enforces the budget. Returns the (possibly truncated) summary and
    /// the surviving chunks; `recent_messages` always survive whole.
    #[must_use]
    pub fn enforce(
        &self,
        user_message: &str,
        summary_text: Option<String>,
        recent_messages: &[ChatMessage],
        mut chunks: Vec<RetrievedChunk>,
    ) -> (Option<String>, Vec<RetrievedChunk>) {
        let fixed_cost = user_message.len()
            + recent_messages.iter().map(|m| m.content.len()).sum::<usize>();

        let mut summary = summary_text;
        let budget = self.budget_chars.saturating_sub(fixed_cost);

        let size = |summary: &Option<String>, chunks: &[RetrievedChunk]| -> usize {
            summary.as_ref().map_or(0, String::len)
                + chunks.iter().map(|c| c.scoring_text().len()).sum::<usize>()
        };

        if size(&summary, &chunks) <= budget {
            return (summary, chunks);
        }

        // Chunks are ranked best-first; drop from the tail
        while chunks.len() > 1 && size(&summary, &chunks) > budget {
            let dropped = chunks.pop();
            if let Some(dropped) = dropped {
                tracing::debug!(
                    chunk_id = %dropped.chunk.chunk_id,
                    "budget: dropped low-ranked chunk"
                );
            }
        }

        // Then truncate the summary, never the recent messages
        if size(&summary, &chunks) > budget
            && let Some(ref mut text) = summary
        {
            let chunk_cost: usize = chunks.iter().map(|c| c.scoring_text().len()).sum();
            let allowed = budget.saturating_sub(chunk_cost);
            if text.len() > allowed {
                let mut cut = allowed;
                while cut > 0 && !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
                tracing::debug!(remaining = text.len(), "budget: summary truncated");
            }
        }

        (summary.filter(|s| !s.is_empty()), chunks)
    }
}
