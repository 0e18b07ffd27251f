//! Tool dispatch for one model-response node. Batches of read-only tools
//! run concurrently; anything that writes or executes runs strictly in call
//! order. Either way the resulting tool returns land in the message store
//! in call order, and every tool call ends up with exactly one return.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::authorize::{authorize_tool, AuthDecision, AuthorizationPrompt};
use crate::error::CoreError;
use crate::events::UiHooks;
use crate::model::ModelResponse;
use crate::session::{RequestContext, SessionState, ToolCallRecord};
use crate::tools::{PresentPlanTool, Tool, ToolKind, ToolRegistry, PRESENT_PLAN_TOOL};

/// Best-effort normalization of model-supplied tool arguments. Models
/// occasionally emit the argument object as an escaped JSON string, or
/// nothing at all; strict mode turns the unrecoverable cases into a
/// poisoned node instead of guessing.
pub fn parse_tool_args(args: &Value, strict: bool) -> Result<Value, CoreError> {
    match args {
        Value::Object(_) => Ok(args.clone()),
        Value::Null => Ok(json!({})),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            _ if strict => Err(CoreError::ToolBatchingParse(format!(
                "argument string is not a JSON object: {s:?}"
            ))),
            _ => {
                debug!("wrapping non-object tool argument string");
                Ok(json!({ "input": s }))
            }
        },
        other if strict => Err(CoreError::ToolBatchingParse(format!(
            "arguments must be a JSON object, got {other}"
        ))),
        other => Ok(json!({ "input": other })),
    }
}

enum Planned {
    Run(Arc<dyn Tool>),
    /// Denied, unknown, or otherwise skipped; the string is the return
    /// content.
    Skip(String),
}

pub struct ToolDispatcher<'a> {
    registry: &'a ToolRegistry,
    prompt: Option<&'a dyn AuthorizationPrompt>,
    hooks: &'a dyn UiHooks,
    strict_args: bool,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        prompt: Option<&'a dyn AuthorizationPrompt>,
        hooks: &'a dyn UiHooks,
        strict_args: bool,
    ) -> Self {
        Self {
            registry,
            prompt,
            hooks,
            strict_args,
        }
    }

    /// Execute every tool call in the node. Returns the number of calls
    /// processed. If anything escapes (user abort, poisoned arguments),
    /// orphaned calls are patched with synthetic returns before the error
    /// propagates.
    pub async fn dispatch_node(
        &self,
        state: &mut SessionState,
        context: &mut RequestContext,
        response: &ModelResponse,
    ) -> Result<usize, CoreError> {
        let batch_id = context.next_batch_id();
        let calls = response.tool_calls();
        if calls.is_empty() {
            return Ok(0);
        }

        let result = self.run_batch(state, context, &calls, batch_id).await;
        if let Err(e) = &result {
            let reason = match e {
                CoreError::UserAbort => "request aborted by user".to_string(),
                other => other.to_string(),
            };
            state.messages.patch_orphaned(&reason);
        }
        result
    }

    async fn run_batch(
        &self,
        state: &mut SessionState,
        context: &mut RequestContext,
        calls: &[(&str, &str, &Value)],
        batch_id: u64,
    ) -> Result<usize, CoreError> {
        let mut parsed: Vec<(String, String, Value)> = Vec::with_capacity(calls.len());
        for (id, tool, args) in calls {
            let args = parse_tool_args(args, self.strict_args).map_err(|e| {
                warn!(tool, error = %e, "rejecting malformed tool arguments");
                e
            })?;
            parsed.push((id.to_string(), tool.to_string(), args));
        }

        let all_read_only = parsed
            .iter()
            .all(|(_, name, _)| matches!(self.registry.kind_of(name), Some(ToolKind::ReadOnly)));

        if all_read_only {
            self.run_parallel(state, context, parsed, batch_id).await
        } else {
            self.run_sequential(state, context, parsed, batch_id).await
        }
    }

    /// Call order throughout: authorize, invoke, append, then on to the
    /// next call.
    async fn run_sequential(
        &self,
        state: &mut SessionState,
        context: &mut RequestContext,
        parsed: Vec<(String, String, Value)>,
        batch_id: u64,
    ) -> Result<usize, CoreError> {
        let count = parsed.len();
        for (id, name, args) in parsed {
            let content = match self.registry.get(&name) {
                None => format!("Unknown tool '{name}'."),
                Some(tool) => {
                    let tool = tool.clone();
                    match authorize_tool(state, self.prompt, tool.as_ref(), &args).await? {
                        AuthDecision::Denied { reason } => reason,
                        AuthDecision::Approved => {
                            self.invoke_one(state, tool, &name, &args).await
                        }
                    }
                }
            };
            state
                .messages
                .push_tool_return(id.as_str(), name.as_str(), content.as_str());
            context.record_tool_call(ToolCallRecord {
                tool: name,
                args,
                result: Some(content),
                batch_id: Some(batch_id),
            });
        }
        Ok(count)
    }

    /// Authorization runs first, sequentially and in call order, so every
    /// prompt observes ignore-list updates from the prompts before it.
    /// Only then do the approved invocations launch concurrently.
    async fn run_parallel(
        &self,
        state: &mut SessionState,
        context: &mut RequestContext,
        parsed: Vec<(String, String, Value)>,
        batch_id: u64,
    ) -> Result<usize, CoreError> {
        let mut plans: Vec<Planned> = Vec::with_capacity(parsed.len());
        for (_, name, args) in &parsed {
            match self.registry.get(name) {
                None => plans.push(Planned::Skip(format!("Unknown tool '{name}'."))),
                Some(tool) => {
                    match authorize_tool(state, self.prompt, tool.as_ref(), args).await? {
                        AuthDecision::Approved => plans.push(Planned::Run(tool.clone())),
                        AuthDecision::Denied { reason } => plans.push(Planned::Skip(reason)),
                    }
                }
            }
        }

        let invocations = parsed.iter().zip(&plans).map(|((_, _, args), plan)| {
            let tool = match plan {
                Planned::Run(tool) => Some(tool.clone()),
                Planned::Skip(_) => None,
            };
            let args = args.clone();
            async move {
                let tool = tool?;
                let started = Instant::now();
                let content = match tool.invoke(&args).await {
                    Ok(out) => out,
                    Err(e) => format!("Error: {e}"),
                };
                Some((content, started.elapsed().as_millis() as u64))
            }
        });
        // join_all yields results in input order, which is call order.
        let results = join_all(invocations).await;

        let count = parsed.len();
        for (((id, name, args), plan), result) in
            parsed.into_iter().zip(plans).zip(results)
        {
            let content = match plan {
                Planned::Skip(reason) => reason,
                Planned::Run(_) => {
                    let (content, duration_ms) =
                        result.unwrap_or_else(|| ("Error: tool produced no result".into(), 0));
                    self.hooks
                        .on_tool_result(&name, &args, &content, duration_ms)
                        .await;
                    content
                }
            };
            state
                .messages
                .push_tool_return(id.as_str(), name.as_str(), content.as_str());
            context.record_tool_call(ToolCallRecord {
                tool: name,
                args,
                result: Some(content),
                batch_id: Some(batch_id),
            });
        }
        Ok(count)
    }

    async fn invoke_one(
        &self,
        state: &mut SessionState,
        tool: Arc<dyn Tool>,
        name: &str,
        args: &Value,
    ) -> String {
        let started = Instant::now();
        let content = if name == PRESENT_PLAN_TOOL && state.plan_reviewer.is_some() {
            self.present_plan(state, args).await
        } else {
            match tool.invoke(args).await {
                Ok(out) => out,
                Err(e) => format!("Error: {e}"),
            }
        };
        self.hooks
            .on_tool_result(name, args, &content, started.elapsed().as_millis() as u64)
            .await;
        content
    }

    /// Route the plan through the session's reviewer. Approval ends plan
    /// mode so the next iteration can use write and execute tools.
    async fn present_plan(&self, state: &mut SessionState, args: &Value) -> String {
        let Some(reviewer) = state.plan_reviewer.clone() else {
            return "Error: no plan reviewer attached".into();
        };
        match PresentPlanTool::plan_text(args) {
            Err(e) => format!("Error: {e}"),
            Ok(plan) => {
                let decision = reviewer.review(&plan).await;
                if decision.approved {
                    state.set_plan_mode(false);
                    "Plan approved. Plan mode is now off; begin the implementation.".into()
                } else {
                    format!(
                        "Plan rejected: {}",
                        decision
                            .feedback
                            .unwrap_or_else(|| "no feedback provided".into())
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorize::AuthorizationReply;
    use crate::error::ToolError;
    use crate::events::{NoopHooks, PlanDecision, PlanReviewer};
    use crate::message::{Message, Part};
    use crate::session::UserConfig;
    use crate::tokens::CallUsage;
    use crate::tools::ToolSchema;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Read-only tool that records its start order and can stall.
    struct SlowTool {
        name: &'static str,
        delay_ms: u64,
        starts: Arc<StdMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ToolKind {
            ToolKind::ReadOnly
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.name.into(),
                description: String::new(),
                input_schema: json!({}),
            }
        }

        async fn invoke(&self, _args: &Value) -> Result<String, ToolError> {
            self.starts.lock().unwrap().push(self.name);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(format!("{} finished", self.name))
        }
    }

    struct WriteTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for WriteTool {
        fn name(&self) -> &str {
            "write_file"
        }

        fn kind(&self) -> ToolKind {
            ToolKind::Write
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "write_file".into(),
                description: String::new(),
                input_schema: json!({}),
            }
        }

        async fn invoke(&self, _args: &Value) -> Result<String, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok("written".into())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> ToolKind {
            ToolKind::ReadOnly
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "flaky".into(),
                description: String::new(),
                input_schema: json!({}),
            }
        }

        async fn invoke(&self, _args: &Value) -> Result<String, ToolError> {
            Err(ToolError::Failed("disk on fire".into()))
        }
    }

    fn response_with_calls(calls: &[(&str, &str)]) -> ModelResponse {
        ModelResponse {
            parts: calls
                .iter()
                .map(|(id, tool)| Part::ToolCall {
                    id: id.to_string(),
                    tool: tool.to_string(),
                    args: json!({}),
                })
                .collect(),
            usage: CallUsage::default(),
        }
    }

    fn returns_in_store(state: &SessionState) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for m in state.messages.messages() {
            if let Message::ModelRequest { parts } = m {
                for p in parts {
                    if let Part::ToolReturn { tool, content, .. } = p {
                        out.push((tool.clone(), content.clone()));
                    }
                }
            }
        }
        out
    }

    fn seed_state(response: &ModelResponse) -> SessionState {
        let mut state = SessionState::new(UserConfig::default());
        state.messages.push_user_prompt("task");
        state.messages.append(Message::ModelResponse {
            parts: response.parts.clone(),
        });
        state
    }

    #[tokio::test]
    async fn parallel_batch_preserves_call_order() {
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let registry = ToolRegistry::new()
            .add(SlowTool { name: "slow", delay_ms: 50, starts: starts.clone() })
            .add(SlowTool { name: "fast", delay_ms: 0, starts: starts.clone() });
        let response = response_with_calls(&[("c1", "slow"), ("c2", "fast")]);
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");

        let dispatcher = ToolDispatcher::new(&registry, None, &NoopHooks, false);
        let count = dispatcher
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap();
        assert_eq!(count, 2);

        // "fast" finishes first, but the store sees call order.
        let returns = returns_in_store(&state);
        assert_eq!(returns[0].0, "slow");
        assert_eq!(returns[1].0, "fast");
        // Both actually started before the slow one finished (concurrency).
        assert_eq!(starts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn write_tool_forces_sequential_order() {
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .add(WriteTool { invocations: invocations.clone() })
            .add(SlowTool { name: "reader", delay_ms: 0, starts: starts.clone() });
        let response = response_with_calls(&[("c1", "write_file"), ("c2", "reader")]);
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");

        ToolDispatcher::new(&registry, None, &NoopHooks, false)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap();

        let returns = returns_in_store(&state);
        assert_eq!(returns[0], ("write_file".into(), "written".into()));
        assert_eq!(returns[1].0, "reader");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_failure_becomes_return_content() {
        let registry = ToolRegistry::new().add(FailingTool);
        let response = response_with_calls(&[("c1", "flaky")]);
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");

        ToolDispatcher::new(&registry, None, &NoopHooks, false)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap();

        let returns = returns_in_store(&state);
        assert_eq!(returns[0].1, "Error: disk on fire");
    }

    #[tokio::test]
    async fn plan_mode_denial_reaches_the_store_without_invoking() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().add(WriteTool { invocations: invocations.clone() });
        let response = response_with_calls(&[("c1", "write_file")]);
        let mut state = seed_state(&response);
        state.plan_mode = true;
        let mut ctx = RequestContext::new("q");

        ToolDispatcher::new(&registry, None, &NoopHooks, false)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap();

        let returns = returns_in_store(&state);
        assert!(returns[0].1.starts_with("Blocked by plan mode"));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    struct AbortOnSecondPrompt {
        asked: AtomicUsize,
    }

    #[async_trait]
    impl AuthorizationPrompt for AbortOnSecondPrompt {
        async fn authorize(&self, _tool: &str, _args: &Value) -> AuthorizationReply {
            let n = self.asked.fetch_add(1, Ordering::SeqCst);
            AuthorizationReply {
                approved: n == 0,
                skip_future: false,
                abort: n > 0,
            }
        }
    }

    #[tokio::test]
    async fn abort_mid_batch_patches_orphans() {
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let registry = ToolRegistry::new()
            .add(SlowTool { name: "one", delay_ms: 0, starts: starts.clone() })
            .add(SlowTool { name: "two", delay_ms: 0, starts: starts.clone() });
        let response = response_with_calls(&[("c1", "one"), ("c2", "two")]);
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");

        let prompt = AbortOnSecondPrompt { asked: AtomicUsize::new(0) };
        let err = ToolDispatcher::new(&registry, Some(&prompt), &NoopHooks, false)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UserAbort));

        // Every tool call has a return; the aborted ones are synthetic.
        assert!(state.messages.orphaned_tool_calls().is_empty());
        // Nothing was invoked: the abort landed during batch authorization,
        // before any launch.
        assert!(starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_counter_ticks_once_per_node() {
        let registry = ToolRegistry::new();
        let response = ModelResponse {
            parts: vec![Part::Text("no tools".into())],
            usage: CallUsage::default(),
        };
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");
        let dispatcher = ToolDispatcher::new(&registry, None, &NoopHooks, false);
        dispatcher.dispatch_node(&mut state, &mut ctx, &response).await.unwrap();
        dispatcher.dispatch_node(&mut state, &mut ctx, &response).await.unwrap();
        assert_eq!(ctx.batch_counter, 2);
    }

    struct ApprovingReviewer;

    #[async_trait]
    impl PlanReviewer for ApprovingReviewer {
        async fn review(&self, _plan: &str) -> PlanDecision {
            PlanDecision { approved: true, feedback: None }
        }
    }

    #[tokio::test]
    async fn approved_plan_exits_plan_mode() {
        let registry = ToolRegistry::new().add(PresentPlanTool);
        let response = ModelResponse {
            parts: vec![Part::ToolCall {
                id: "c1".into(),
                tool: PRESENT_PLAN_TOOL.into(),
                args: json!({"plan": "1. do the thing"}),
            }],
            usage: CallUsage::default(),
        };
        let mut state = seed_state(&response);
        state.plan_mode = true;
        state.set_plan_reviewer(Arc::new(ApprovingReviewer));
        let mut ctx = RequestContext::new("q");

        ToolDispatcher::new(&registry, None, &NoopHooks, false)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap();

        assert!(!state.plan_mode);
        let returns = returns_in_store(&state);
        assert!(returns[0].1.starts_with("Plan approved"));
    }

    #[test]
    fn arg_parsing_is_best_effort_unless_strict() {
        assert_eq!(
            parse_tool_args(&json!({"a": 1}), false).unwrap(),
            json!({"a": 1}),
        );
        assert_eq!(parse_tool_args(&Value::Null, false).unwrap(), json!({}));
        assert_eq!(
            parse_tool_args(&json!("{\"path\": \"x\"}"), false).unwrap(),
            json!({"path": "x"}),
        );
        assert_eq!(
            parse_tool_args(&json!("not json"), false).unwrap(),
            json!({"input": "not json"}),
        );
        assert!(matches!(
            parse_tool_args(&json!("not json"), true),
            Err(CoreError::ToolBatchingParse(_)),
        ));
        assert!(matches!(
            parse_tool_args(&json!([1, 2]), true),
            Err(CoreError::ToolBatchingParse(_)),
        ));
    }

    #[tokio::test]
    async fn malformed_args_poison_the_node_and_patch_orphans() {
        let registry = ToolRegistry::new().add(FailingTool);
        let response = ModelResponse {
            parts: vec![Part::ToolCall {
                id: "c1".into(),
                tool: "flaky".into(),
                args: json!(42),
            }],
            usage: CallUsage::default(),
        };
        let mut state = seed_state(&response);
        let mut ctx = RequestContext::new("q");

        let err = ToolDispatcher::new(&registry, None, &NoopHooks, true)
            .dispatch_node(&mut state, &mut ctx, &response)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolBatchingParse(_)));
        assert!(state.messages.orphaned_tool_calls().is_empty());
    }
}
