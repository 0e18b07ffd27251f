use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::PlanReviewer;
use crate::intervene::FORCED_REACT_LIMIT;
use crate::message::MessageStore;
use crate::tokens::CallUsage;

/// React guidance kept per request: only the newest few entries matter.
const REACT_GUIDANCE_KEEP: usize = 5;

/// Endpoint wiring for one model provider. Changing any field must
/// invalidate cached agents, so the whole subtree feeds the version hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in configuration.
    pub api_key_env: String,
}

/// User configuration recognized by the core. Hosts deserialize this from
/// their config file and hand it over; `skip_*` safety toggles and other
/// host-level keys stay out of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub default_model: String,
    /// Aggressive compaction thresholds for small-context local models.
    pub local_mode: bool,
    pub context_window_size: u64,
    pub max_retries: u32,
    pub tool_strict_validation: bool,
    /// Pause before each model call, in milliseconds. 0 disables pacing.
    pub request_delay_ms: u64,
    /// Per-iteration model-call timeout, in seconds.
    pub global_request_timeout: u64,
    /// Keyed by provider id. Ordered map so the version hash is stable.
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            default_model: "anthropic:claude-sonnet-4".into(),
            local_mode: false,
            context_window_size: 200_000,
            max_retries: 3,
            tool_strict_validation: false,
            request_delay_ms: 0,
            global_request_timeout: 120,
            providers: BTreeMap::new(),
        }
    }
}

/// Per-REPL-session state. Owned by the session, borrowed mutably by the
/// orchestrator for the duration of one request. All fields are declared
/// here up front; interventions and tools go through named setters.
pub struct SessionState {
    pub messages: MessageStore,
    pub current_model: String,
    pub user_config: UserConfig,
    pub last_call_usage: CallUsage,
    pub total_tokens: u64,
    pub max_tokens: u64,
    pub plan_mode: bool,
    pub yolo: bool,
    pub tool_ignore: HashSet<String>,
    pub plan_reviewer: Option<Arc<dyn PlanReviewer>>,
}

impl SessionState {
    pub fn new(user_config: UserConfig) -> Self {
        Self {
            current_model: user_config.default_model.clone(),
            max_tokens: user_config.context_window_size,
            messages: MessageStore::new(),
            user_config,
            last_call_usage: CallUsage::default(),
            total_tokens: 0,
            plan_mode: false,
            yolo: false,
            tool_ignore: HashSet::new(),
            plan_reviewer: None,
        }
    }

    /// Clear per-request fields before a new request begins. The rest of
    /// the per-request bookkeeping lives in `RequestContext`, which is
    /// constructed fresh.
    pub fn reset_for_new_request(&mut self) {
        self.last_call_usage = CallUsage::default();
    }

    pub fn record_usage(&mut self, usage: &CallUsage) {
        self.total_tokens += usage.total_tokens();
        self.last_call_usage = usage.clone();
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.current_model = model.into();
    }

    pub fn set_config(&mut self, config: UserConfig) {
        self.max_tokens = config.context_window_size;
        self.user_config = config;
    }

    pub fn ignore_tool(&mut self, name: impl Into<String>) {
        self.tool_ignore.insert(name.into());
    }

    pub fn is_tool_ignored(&self, name: &str) -> bool {
        self.tool_ignore.contains(name)
    }

    pub fn set_plan_mode(&mut self, on: bool) {
        self.plan_mode = on;
    }

    pub fn set_plan_reviewer(&mut self, reviewer: Arc<dyn PlanReviewer>) {
        self.plan_reviewer = Some(reviewer);
    }
}

/// One executed (or attempted) tool call, for request-level bookkeeping.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: Value,
    pub result: Option<String>,
    pub batch_id: Option<u64>,
}

/// Per-request bookkeeping. Created fresh at the top of `process_request`
/// and discarded when the request ends.
pub struct RequestContext {
    pub request_id: String,
    pub iteration: usize,
    pub tool_calls: Vec<ToolCallRecord>,
    pub react_forced_calls: u32,
    pub react_guidance: Vec<String>,
    pub batch_counter: u64,
    pub consecutive_empty_responses: u32,
    pub original_query: String,
    pub task_completed: bool,
    pub awaiting_user_guidance: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl RequestContext {
    pub fn new(original_query: impl Into<String>) -> Self {
        let mut request_id = uuid::Uuid::new_v4().simple().to_string();
        request_id.truncate(8);
        Self {
            request_id,
            iteration: 0,
            tool_calls: Vec::new(),
            react_forced_calls: 0,
            react_guidance: Vec::new(),
            batch_counter: 0,
            consecutive_empty_responses: 0,
            original_query: original_query.into(),
            task_completed: false,
            awaiting_user_guidance: false,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn set_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    pub fn next_batch_id(&mut self) -> u64 {
        let id = self.batch_counter;
        self.batch_counter += 1;
        id
    }

    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls.push(record);
    }

    pub fn last_tool_call(&self) -> Option<&ToolCallRecord> {
        self.tool_calls.last()
    }

    /// Count one forced react invocation. Saturates at the limit; returns
    /// false when the budget is already spent.
    pub fn record_forced_react(&mut self) -> bool {
        if self.react_forced_calls >= FORCED_REACT_LIMIT {
            return false;
        }
        self.react_forced_calls += 1;
        true
    }

    /// Keep only the newest few guidance entries.
    pub fn push_react_guidance(&mut self, guidance: impl Into<String>) {
        self.react_guidance.push(guidance.into());
        if self.react_guidance.len() > REACT_GUIDANCE_KEEP {
            let excess = self.react_guidance.len() - REACT_GUIDANCE_KEEP;
            self.react_guidance.drain(..excess);
        }
    }

    pub fn complete(&mut self) {
        self.task_completed = true;
    }

    pub fn await_user_guidance(&mut self) {
        self.awaiting_user_guidance = true;
    }
}
