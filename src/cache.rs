//! Version-keyed cache of model-bound agents. A cache entry is reusable
//! only while the configuration subset that shaped it is unchanged; the
//! version hash captures exactly that subset.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info};

use crate::agent::Agent;
use crate::model::ModelClientFactory;
use crate::session::UserConfig;
use crate::tools::ToolSchema;

/// Hash of the configuration subset that affects agent construction.
/// The providers subtree is included so endpoint or credential rewiring
/// always misses the cache.
pub fn version_hash(config: &UserConfig) -> u64 {
    let mut h = DefaultHasher::new();
    config.max_retries.hash(&mut h);
    config.tool_strict_validation.hash(&mut h);
    config.request_delay_ms.hash(&mut h);
    config.global_request_timeout.hash(&mut h);
    // BTreeMap serialization is key-ordered, so equal subtrees hash equal.
    serde_json::to_string(&config.providers)
        .unwrap_or_default()
        .hash(&mut h);
    h.finish()
}

#[derive(Default)]
pub struct AgentCache {
    entries: HashMap<(String, u64), Arc<Agent>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the agent for `(model, version_hash(config))`, constructing and
    /// caching it on a miss.
    pub fn get_or_create(
        &mut self,
        model: &str,
        config: &UserConfig,
        tools: Vec<ToolSchema>,
        factory: &dyn ModelClientFactory,
    ) -> Arc<Agent> {
        let key = (model.to_string(), version_hash(config));
        if let Some(agent) = self.entries.get(&key) {
            debug!(model, version = key.1, "agent cache hit");
            return agent.clone();
        }

        info!(model, version = key.1, "constructing agent");
        let client = factory.build(model, config);
        let agent = Arc::new(Agent::new(model, client, tools, config));
        self.entries.insert(key, agent.clone());
        agent
    }

    /// Drop every cached instance of one model, across all versions.
    pub fn invalidate(&mut self, model: &str) {
        let before = self.entries.len();
        self.entries.retain(|(m, _), _| m != model);
        if self.entries.len() != before {
            info!(model, dropped = before - self.entries.len(), "invalidated cached agents");
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
