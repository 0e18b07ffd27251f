//! Per-invocation tool authorization. Four rules, evaluated in order:
//! plan-mode block, yolo bypass, ignore-list, interactive prompt.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::CoreError;
use crate::session::SessionState;
use crate::tools::Tool;

/// What the host returned from an interactive authorization prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizationReply {
    pub approved: bool,
    /// Stop asking about this tool for the rest of the session.
    pub skip_future: bool,
    /// Abort the whole request.
    pub abort: bool,
}

/// Asks the host UI whether a tool invocation may proceed.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn authorize(&self, tool: &str, args: &Value) -> AuthorizationReply;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Approved,
    Denied { reason: String },
}

/// Run the authorization pipeline for one tool call. Mutates
/// `state.tool_ignore` when the host answers "don't ask again"; a host
/// abort surfaces as `CoreError::UserAbort`.
///
/// Callers batching read-only tools must collect decisions for the whole
/// batch through this function before launching any invocation, so every
/// prompt observes the ignore-list writes of the prompts before it.
pub async fn authorize_tool(
    state: &mut SessionState,
    prompt: Option<&dyn AuthorizationPrompt>,
    tool: &dyn Tool,
    args: &Value,
) -> Result<AuthDecision, CoreError> {
    if state.plan_mode && !tool.is_plan_safe() {
        return Ok(AuthDecision::Denied {
            reason: format!(
                "Blocked by plan mode: '{}' can modify state. Use read-only tools, \
                 or present a plan with 'present_plan'.",
                tool.name()
            ),
        });
    }

    if state.yolo {
        return Ok(AuthDecision::Approved);
    }

    if state.is_tool_ignored(tool.name()) {
        debug!(tool = tool.name(), "approved via ignore list");
        return Ok(AuthDecision::Approved);
    }

    let Some(prompt) = prompt else {
        // No interactive host attached; nothing to ask.
        return Ok(AuthDecision::Approved);
    };

    let reply = prompt.authorize(tool.name(), args).await;
    if reply.abort {
        return Err(CoreError::UserAbort);
    }
    if reply.skip_future {
        state.ignore_tool(tool.name());
    }
    if reply.approved {
        Ok(AuthDecision::Approved)
    } else {
        Ok(AuthDecision::Denied {
            reason: format!("Tool '{}' was not approved by the user.", tool.name()),
        })
    }
}
