//! Proactive history compaction. Runs once per request, before the first
//! model call: old tool-return content beyond a protection boundary is
//! replaced with a short placeholder so long sessions stay inside the
//! context window.

use tracing::{debug, info};

use crate::message::{MessageStore, Part, ToolReturnLoc};
use crate::session::UserConfig;
use crate::tokens::estimate_tokens;

/// Replacement text for pruned tool returns. Bit-exact; hosts key off it.
pub const PRUNE_PLACEHOLDER: &str = "[Old tool result content cleared]";

const STANDARD_PROTECT_TOKENS: u64 = 40_000;
const STANDARD_MINIMUM_THRESHOLD: u64 = 20_000;
const LOCAL_PROTECT_TOKENS: u64 = 2_000;
const LOCAL_MINIMUM_THRESHOLD: u64 = 500;

/// Thresholds resolved from configuration, fixed until the config changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compactor {
    protect_tokens: u64,
    minimum_threshold: u64,
}

impl Compactor {
    pub fn from_config(config: &UserConfig) -> Self {
        if config.local_mode {
            Self {
                protect_tokens: LOCAL_PROTECT_TOKENS,
                minimum_threshold: LOCAL_MINIMUM_THRESHOLD,
            }
        } else {
            Self {
                protect_tokens: STANDARD_PROTECT_TOKENS,
                minimum_threshold: STANDARD_MINIMUM_THRESHOLD,
            }
        }
    }

    pub fn protect_tokens(&self) -> u64 {
        self.protect_tokens
    }

    /// Prune tool returns older than the protection boundary. Returns total
    /// reclaimed tokens (0 when nothing qualified). Idempotent: pruned parts
    /// estimate at placeholder size and reclaim nothing on a second pass.
    pub fn compact(&self, store: &mut MessageStore, model: &str) -> u64 {
        if store.user_turn_count() < 2 {
            return 0;
        }

        // Walk newest-to-oldest; everything inside the protection budget is
        // kept, the part that crosses it and everything older is a candidate.
        let mut protected: u64 = 0;
        let mut candidates: Vec<ToolReturnLoc> = Vec::new();
        let mut candidate_tokens: u64 = 0;
        for loc in store.iter_tool_returns_reverse() {
            let tokens = match store.part(loc) {
                Some(Part::ToolReturn { content, .. }) => estimate_tokens(content, model),
                _ => 0,
            };
            if candidates.is_empty() && protected + tokens <= self.protect_tokens {
                protected += tokens;
            } else {
                candidates.push(loc);
                candidate_tokens += tokens;
            }
        }

        if candidate_tokens < self.minimum_threshold {
            debug!(
                candidate_tokens,
                minimum = self.minimum_threshold,
                "compaction below minimum threshold, skipping"
            );
            return 0;
        }

        let mut reclaimed = 0;
        for loc in &candidates {
            reclaimed += store.prune_part(*loc, PRUNE_PLACEHOLDER, model);
        }
        info!(
            pruned = candidates.len(),
            reclaimed, protected, "compacted old tool returns"
        );
        reclaimed
    }
}
