pub mod agent;
pub mod authorize;
pub mod cache;
pub mod compact;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod intervene;
pub mod message;
pub mod model;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod tokens;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use agent::{Agent, AgentRun, ContextInjector};
pub use authorize::{authorize_tool, AuthDecision, AuthorizationPrompt, AuthorizationReply};
pub use cache::{version_hash, AgentCache};
pub use compact::{Compactor, PRUNE_PLACEHOLDER};
pub use dispatch::ToolDispatcher;
pub use error::{CoreError, ModelError, ToolError};
pub use events::{NoopHooks, PlanDecision, PlanReviewer, UiHooks};
pub use intervene::{
    InterventionEngine, LoopSignal, COMPLETION_MARKERS, DEFAULT_MAX_ITERATIONS,
    FORCED_REACT_INTERVAL, FORCED_REACT_LIMIT, UNPRODUCTIVE_LIMIT,
};
pub use message::{Message, MessageStore, Part};
pub use model::{
    AnthropicClient, HttpClientFactory, ModelClient, ModelClientFactory, ModelRequest,
    ModelResponse, StreamEvent,
};
pub use session::{
    ProviderConfig, RequestContext, SessionState, ToolCallRecord, UserConfig,
};
pub use snapshot::{JsonlSnapshotStore, SessionSnapshot, SnapshotStore};
pub use stream::{Streamer, STREAM_THROTTLE_MS};
pub use tokens::{estimate_tokens, CallUsage};
pub use tools::{PresentPlanTool, Tool, ToolKind, ToolRegistry, ToolSchema, PRESENT_PLAN_TOOL};

/// Result of one processed request.
#[derive(Debug)]
pub struct RequestOutcome {
    pub final_text: String,
    pub usage: CallUsage,
    pub completed: bool,
    pub awaiting_user_guidance: bool,
    /// Index of the last iteration that ran.
    pub iteration: usize,
}

/// Everything a REPL session owns: state, the agent cache, the tool
/// registry, and the host seams. Created once at REPL start and handed to a
/// `RequestOrchestrator` per request. Nothing here is a global.
pub struct Session {
    pub state: SessionState,
    registry: ToolRegistry,
    cache: AgentCache,
    factory: Arc<dyn ModelClientFactory>,
    hooks: Arc<dyn UiHooks>,
    prompt: Option<Arc<dyn AuthorizationPrompt>>,
    streamer: Streamer,
    compactor: Compactor,
    max_iterations: usize,
}

impl Session {
    pub fn new(config: UserConfig, registry: ToolRegistry) -> Self {
        let compactor = Compactor::from_config(&config);
        Self {
            state: SessionState::new(config),
            registry,
            cache: AgentCache::new(),
            factory: Arc::new(HttpClientFactory),
            hooks: Arc::new(NoopHooks),
            prompt: None,
            streamer: Streamer::new(),
            compactor,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ModelClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn UiHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_authorization_prompt(mut self, prompt: Arc<dyn AuthorizationPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn cached_agents(&self) -> usize {
        self.cache.len()
    }

    /// Switch models. Cached agents for the old model are stale and dropped.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let old = self.state.current_model.clone();
        self.state.set_model(model);
        if old != self.state.current_model {
            self.cache.invalidate(&old);
        }
    }

    /// Replace the configuration. A provider-subtree change drops every
    /// cached agent; compaction thresholds are re-derived.
    pub fn update_config(&mut self, config: UserConfig) {
        if config.providers != self.state.user_config.providers {
            self.cache.clear_all();
        }
        self.compactor = Compactor::from_config(&config);
        self.state.set_config(config);
    }

    pub async fn process_request(
        &mut self,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome, CoreError> {
        RequestOrchestrator::new(self).process_request(user_text, cancel).await
    }

    pub async fn save_snapshot(
        &self,
        session_id: &str,
        store: &dyn SnapshotStore,
    ) -> Result<(), CoreError> {
        store
            .save(
                session_id,
                &SessionSnapshot {
                    messages: self.state.messages.clone(),
                    current_model: self.state.current_model.clone(),
                    total_tokens: self.state.total_tokens,
                    saved_at: chrono::Utc::now(),
                },
            )
            .await
    }

    /// Restore a previously saved conversation. Returns false when the
    /// store has nothing for this id.
    pub async fn load_snapshot(
        &mut self,
        session_id: &str,
        store: &dyn SnapshotStore,
    ) -> Result<bool, CoreError> {
        match store.load(session_id).await? {
            Some(snapshot) => {
                self.state.messages = snapshot.messages;
                self.state.current_model = snapshot.current_model;
                self.state.total_tokens = snapshot.total_tokens;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Drives one user request: reset state, compact history, then iterate the
/// model/tool loop until completion, abort, or the iteration-limit handoff.
pub struct RequestOrchestrator<'s> {
    session: &'s mut Session,
}

impl<'s> RequestOrchestrator<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    pub async fn process_request(
        &mut self,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome, CoreError> {
        self.session.state.reset_for_new_request();
        let mut context = RequestContext::new(user_text);
        info!(
            request_id = %context.request_id,
            model = %self.session.state.current_model,
            "processing request"
        );

        self.session.state.messages.push_user_prompt(user_text);

        let model = self.session.state.current_model.clone();
        self.session
            .compactor
            .compact(&mut self.session.state.messages, &model);

        match self.drive(&mut context, &cancel).await {
            Ok(outcome) => {
                let elapsed_ms = (chrono::Utc::now() - context.started_at).num_milliseconds();
                info!(
                    request_id = %context.request_id,
                    iteration = outcome.iteration,
                    completed = outcome.completed,
                    elapsed_ms,
                    "request finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                let reason = match &e {
                    CoreError::UserAbort => "request aborted by user".to_string(),
                    other => other.to_string(),
                };
                self.session.state.messages.patch_orphaned(&reason);
                match &e {
                    CoreError::UserAbort | CoreError::GlobalRequestTimeout(_) => {
                        self.session.cache.invalidate(&model);
                    }
                    other => {
                        error!(
                            request_id = %context.request_id,
                            error = %other,
                            "request failed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        context: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome, CoreError> {
        let session = &mut *self.session;
        let model = session.state.current_model.clone();
        let timeout = Duration::from_secs(session.state.user_config.global_request_timeout);
        let mut engine = InterventionEngine::new(session.max_iterations);
        let mut request_usage = CallUsage::default();

        let mut run = AgentRun::new(session.cache.get_or_create(
            &model,
            &session.state.user_config,
            session.registry.schemas(),
            session.factory.as_ref(),
        ));

        for i in 0..session.max_iterations {
            context.set_iteration(i);

            let agent = session.cache.get_or_create(
                &model,
                &session.state.user_config,
                session.registry.schemas(),
                session.factory.as_ref(),
            );
            run.set_agent(agent.clone());

            let request = run.build_request(&session.state.messages);
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::UserAbort),
                outcome = tokio::time::timeout(
                    timeout,
                    session.streamer.run_node(&agent, request, session.hooks.as_ref(), cancel),
                ) => match outcome {
                    Ok(inner) => inner?,
                    Err(_) => return Err(CoreError::GlobalRequestTimeout(timeout)),
                },
            };

            session.state.messages.append(Message::ModelResponse {
                parts: response.parts.clone(),
            });
            session.state.record_usage(&response.usage);
            request_usage.accumulate(&response.usage);

            let dispatcher = ToolDispatcher::new(
                &session.registry,
                session.prompt.as_deref(),
                session.hooks.as_ref(),
                agent.strict_tools(),
            );
            let tools_executed = dispatcher
                .dispatch_node(&mut session.state, context, &response)
                .await?;

            let signal =
                engine.after_node(&mut session.state, context, &response, tools_executed, &mut run);
            if signal == LoopSignal::Break || context.task_completed || context.awaiting_user_guidance {
                break;
            }
        }

        Ok(RequestOutcome {
            final_text: session
                .state
                .messages
                .last_response_text()
                .unwrap_or_default(),
            usage: request_usage,
            completed: context.task_completed,
            awaiting_user_guidance: context.awaiting_user_guidance,
            iteration: context.iteration,
        })
    }
}
