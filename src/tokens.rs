//! Token accounting. Heuristic rather than tokenizer-accurate, which is
//! good enough for compaction boundaries and budget trend detection.

use serde::{Deserialize, Serialize};

/// Estimate token count for a piece of text: `len / 4`, floored.
/// The model identifier is accepted so callers don't need to change when a
/// real per-model tokenizer lands, but it is not consulted today.
pub fn estimate_tokens(text: &str, _model: &str) -> u64 {
    (text.len() as u64) / 4
}

/// Usage for a single model call, as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    /// Provider-reported cost in USD. 0.0 when the provider has no pricing.
    pub cost: f64,
}

impl CallUsage {
    pub fn accumulate(&mut self, other: &CallUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cost += other.cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}
