use async_trait::async_trait;
use serde_json::Value;

/// Host-side rendering hooks. Every method defaults to a no-op so embedders
/// implement only what their UI shows.
#[async_trait]
pub trait UiHooks: Send + Sync {
    async fn on_tool_result(&self, _tool: &str, _args: &Value, _result: &str, _duration_ms: u64) {}

    /// Receives the accumulated response text as it streams in. Throttled by
    /// the streamer to at most one call per 100 ms, plus the final state.
    async fn on_stream_token(&self, _partial_text: &str) {}
}

/// No UI. Fire-and-forget.
pub struct NoopHooks;

#[async_trait]
impl UiHooks for NoopHooks {}

/// The host's verdict on a presented plan.
#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// Presents a plan to the user and waits for approval or feedback.
/// Consumed by the `present_plan` tool while the session is in plan mode.
#[async_trait]
pub trait PlanReviewer: Send + Sync {
    async fn review(&self, plan: &str) -> PlanDecision;
}
