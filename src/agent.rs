use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ModelError;
use crate::message::{Message, MessageStore};
use crate::model::{ModelClient, ModelRequest, ModelResponse, MAX_COMPLETION_TOKENS};
use crate::session::UserConfig;
use crate::tools::ToolSchema;

/// A model-bound agent instance. The tool set is fixed at construction;
/// plan-mode gating happens at invocation time in the authorizer, so a mode
/// flip never rebuilds the agent.
pub struct Agent {
    model: String,
    client: Arc<dyn ModelClient>,
    tools: Vec<ToolSchema>,
    max_retries: u32,
    tool_strict_validation: bool,
    request_delay: Duration,
}

impl Agent {
    pub(crate) fn new(
        model: impl Into<String>,
        client: Arc<dyn ModelClient>,
        tools: Vec<ToolSchema>,
        config: &UserConfig,
    ) -> Self {
        Self {
            model: model.into(),
            client,
            tools,
            max_retries: config.max_retries,
            tool_strict_validation: config.tool_strict_validation,
            request_delay: Duration::from_millis(config.request_delay_ms),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn strict_tools(&self) -> bool {
        self.tool_strict_validation
    }

    pub(crate) fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    /// One model call with pacing and bounded retries on retryable
    /// provider errors.
    pub(crate) async fn infer_with_retry(
        &self,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.client.infer(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        model = %self.model,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Context injected into the next model call without touching the
/// persistent message log.
pub trait ContextInjector {
    fn inject_context(&mut self, note: &str);
}

/// Per-request handle on an agent. Holds guidance queued by interventions;
/// each request build drains the queue into a trailing user message so the
/// very next model call observes it.
pub struct AgentRun {
    agent: Arc<Agent>,
    injected: Vec<String>,
}

impl AgentRun {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            injected: Vec::new(),
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Swap in a freshly-acquired agent. Queued guidance survives the swap;
    /// it belongs to the request, not the agent instance.
    pub fn set_agent(&mut self, agent: Arc<Agent>) {
        self.agent = agent;
    }

    pub fn build_request(&mut self, store: &MessageStore) -> ModelRequest {
        let mut messages = store.messages().to_vec();
        if !self.injected.is_empty() {
            let notes = self
                .injected
                .drain(..)
                .map(|g| format!("- {g}"))
                .collect::<Vec<_>>()
                .join("\n");
            debug!(model = %self.agent.model, "injecting guidance into model context");
            messages.push(Message::UserPrompt {
                text: format!("Guidance from the latest tool activity:\n{notes}"),
            });
        }
        ModelRequest {
            model: self.agent.model.clone(),
            max_completion_tokens: MAX_COMPLETION_TOKENS,
            system: None,
            tools: self.agent.tools.clone(),
            messages,
        }
    }
}

impl ContextInjector for AgentRun {
    fn inject_context(&mut self, note: &str) {
        self.injected.push(note.to_string());
    }
}
