//! The five loop interventions, evaluated in a fixed order after every
//! node: empty-response nudge, productivity alert, forced react, completion
//! detection, iteration limit.

use tracing::{debug, info, warn};

use crate::agent::ContextInjector;
use crate::model::ModelResponse;
use crate::session::{RequestContext, SessionState};

pub const DEFAULT_MAX_ITERATIONS: usize = 15;
pub const UNPRODUCTIVE_LIMIT: u32 = 3;
pub const FORCED_REACT_INTERVAL: usize = 2;
pub const FORCED_REACT_LIMIT: u32 = 5;

/// Bit-exact strings the model uses to declare the task finished.
pub const COMPLETION_MARKERS: [&str; 2] = ["TUNACODE DONE:", "TUNACODE_TASK_COMPLETE"];

/// Phrases that suggest the model still intends more work. They downgrade a
/// completion marker to a warning but do not cancel it.
const PENDING_INTENTION_PHRASES: [&str; 3] = ["let me", "i'll", "going to"];

/// What the orchestrator should do after the interventions ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Continue,
    Break,
}

pub struct InterventionEngine {
    max_iterations: usize,
    /// Consecutive fully-processed iterations with zero tool executions,
    /// as of the end of the previous iteration.
    consecutive_toolless: u32,
}

impl InterventionEngine {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            consecutive_toolless: 0,
        }
    }

    /// Evaluate all five mechanisms for the node just processed.
    pub fn after_node(
        &mut self,
        state: &mut SessionState,
        context: &mut RequestContext,
        response: &ModelResponse,
        tools_executed: usize,
        injector: &mut dyn ContextInjector,
    ) -> LoopSignal {
        // 1. Empty response: nudge with concrete next actions.
        if response.is_empty() {
            context.consecutive_empty_responses += 1;
            if context.consecutive_empty_responses >= 1 {
                info!(
                    streak = context.consecutive_empty_responses,
                    "empty model response, injecting next-action nudge"
                );
                state
                    .messages
                    .push_user_prompt(empty_response_nudge(&context.original_query));
            }
        } else {
            context.consecutive_empty_responses = 0;
        }

        // 2. Productivity: alert once the toolless streak from previous
        // iterations has reached the limit.
        if self.consecutive_toolless >= UNPRODUCTIVE_LIMIT && !context.task_completed {
            info!(
                streak = self.consecutive_toolless,
                "unproductive streak, injecting alert"
            );
            state.messages.push_user_prompt(format!(
                "ALERT: No tools executed for {} iterations. You MUST either: \
                 (1) start with `TUNACODE DONE:` if complete, (2) execute a tool now, \
                 or (3) explain the blocker.",
                self.consecutive_toolless
            ));
        }
        if tools_executed > 0 {
            self.consecutive_toolless = 0;
        } else {
            self.consecutive_toolless += 1;
        }

        // 3. Forced react: reflect on the latest tool result and push the
        // conclusion into the next model call.
        if context.iteration >= FORCED_REACT_INTERVAL
            && context.iteration % FORCED_REACT_INTERVAL == 0
            && context.react_forced_calls < FORCED_REACT_LIMIT
        {
            self.force_react(context, injector);
        }

        // 4. Completion detection.
        let text = response.text();
        if let Some(marker) = COMPLETION_MARKERS.iter().find(|m| text.contains(*m)) {
            let unexecuted = state.messages.orphaned_tool_calls().len();
            if unexecuted > 0 {
                warn!(
                    marker = %marker,
                    unexecuted, "completion marker with queued tool calls, overriding"
                );
            } else {
                let lowered = text.to_lowercase();
                if let Some(phrase) = PENDING_INTENTION_PHRASES
                    .iter()
                    .find(|p| lowered.contains(*p))
                {
                    warn!(
                        marker = %marker,
                        phrase = %phrase, "completion marker alongside pending-intention phrase"
                    );
                }
                info!(marker = %marker, iteration = context.iteration, "task completed");
                context.complete();
                return LoopSignal::Break;
            }
        }

        // 5. Iteration limit: the just-finished iteration was the last one
        // allowed; hand control back to the user.
        if context.iteration + 1 >= self.max_iterations && !context.task_completed {
            info!(
                iteration = context.iteration,
                max = self.max_iterations,
                "iteration limit reached, awaiting user guidance"
            );
            state
                .messages
                .push_user_prompt("Reached iteration limit. Tell me to continue or revise.");
            context.await_user_guidance();
            return LoopSignal::Break;
        }

        LoopSignal::Continue
    }

    fn force_react(&self, context: &mut RequestContext, injector: &mut dyn ContextInjector) {
        if !context.record_forced_react() {
            return;
        }
        let guidance = match context.last_tool_call() {
            Some(record) => format!(
                "Latest result from '{}': {}. Confirm it moves the task forward; \
                 change approach if it does not.",
                record.tool,
                snippet(record.result.as_deref().unwrap_or("<no output>")),
            ),
            None => format!(
                "No tool has run yet for: \"{}\". Pick the single tool call that \
                 makes the most progress and execute it.",
                snippet(&context.original_query),
            ),
        };
        debug!(
            forced_calls = context.react_forced_calls,
            iteration = context.iteration,
            "forced react"
        );
        context.push_react_guidance(guidance.clone());
        injector.inject_context(&guidance);
    }
}

fn empty_response_nudge(original_query: &str) -> String {
    format!(
        "Your last response was empty. The task is still: \"{}\". Act now: \
         (1) execute a tool to gather what you need, (2) write the next piece \
         of the work, or (3) reply starting with `TUNACODE DONE:` if it is \
         already finished.",
        snippet(original_query),
    )
}

fn snippet(text: &str) -> String {
    const MAX_CHARS: usize = 160;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_CHARS).collect();
        format!("{cut}…")
    }
}
