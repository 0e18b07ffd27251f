use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ModelError;
use crate::message::{Message, Part};
use crate::session::UserConfig;
use crate::tokens::CallUsage;
use crate::tools::ToolSchema;

/// Response-size cap sent with every request. Distinct from the context
/// window, which governs compaction.
pub const MAX_COMPLETION_TOKENS: u64 = 8_192;

/// Fully-formed request. The client just sends it.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub max_completion_tokens: u64,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub messages: Vec<Message>,
}

/// One node of model output.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
    pub usage: CallUsage,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        let text: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        text.join("\n")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, tool, args } => Some((id.as_str(), tool.as_str(), args)),
                _ => None,
            })
            .collect()
    }

    /// Zero parts, or text/thought parts that are all whitespace.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Text(s) | Part::Thought(s) => s.trim().is_empty(),
            _ => false,
        })
    }
}

/// Incremental output from a streaming model call. The final element
/// carries the complete response so callers never re-assemble parts.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    Completed(ModelResponse),
}

pub type TokenStream = BoxStream<'static, Result<StreamEvent, ModelError>>;

/// Pure LLM API call. No state, no history, no context management.
/// Request in, response out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn infer(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Token-streaming variant. Clients that cannot stream keep the default
    /// and the streamer falls back to `infer`.
    async fn infer_stream(&self, _request: ModelRequest) -> Result<TokenStream, ModelError> {
        Err(ModelError::StreamUnsupported)
    }
}

/// Builds a wire client for a `provider:model` identifier. Cached agents
/// embed the client they were built with; the agent cache's version hash
/// makes sure provider rewiring reaches here again.
pub trait ModelClientFactory: Send + Sync {
    fn build(&self, model: &str, config: &UserConfig) -> Arc<dyn ModelClient>;
}

/// Splits `provider:model` into its halves. A bare model name maps to the
/// anthropic provider.
pub fn split_model_id(model: &str) -> (&str, &str) {
    match model.split_once(':') {
        Some((provider, name)) => (provider, name),
        None => ("anthropic", model),
    }
}

// ---------------------------------------------------------------------------
// Anthropic wire client
// ---------------------------------------------------------------------------

/// Request body for the messages endpoint. Serialized straight from the
/// typed request; absent sections are omitted rather than sent empty.
#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSchema>,
    messages: Vec<Value>,
}

/// The subset of the messages-endpoint response the core consumes. Every
/// other field is ignored by serde.
#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    /// Block types this core has no use for (citations, server tool use).
    #[serde(other)]
    Unknown,
}

#[derive(Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Claude API client via Anthropic's messages endpoint.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
        }
    }

    fn wire_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut wire = Vec::new();
        for m in messages {
            match m {
                Message::SystemPrompt { text } => system_parts.push(text),
                Message::UserPrompt { text } => {
                    wire.push(json!({"role": "user", "content": text}));
                }
                Message::ModelResponse { parts } => {
                    let content: Vec<Value> = parts
                        .iter()
                        .map(|p| match p {
                            Part::Text(s) => json!({"type": "text", "text": s}),
                            Part::Thought(s) => json!({"type": "thinking", "thinking": s}),
                            Part::ToolCall { id, tool, args } => {
                                json!({"type": "tool_use", "id": id, "name": tool, "input": args})
                            }
                            Part::ToolReturn { id, content, .. } => {
                                json!({"type": "tool_result", "tool_use_id": id, "content": content})
                            }
                        })
                        .collect();
                    wire.push(json!({"role": "assistant", "content": content}));
                }
                Message::ModelRequest { parts } => {
                    let content: Vec<Value> = parts
                        .iter()
                        .map(|p| match p {
                            Part::ToolReturn { id, content, .. } => json!({
                                "type": "tool_result",
                                "tool_use_id": id,
                                "content": content,
                            }),
                            Part::Text(s) | Part::Thought(s) => {
                                json!({"type": "text", "text": s})
                            }
                            Part::ToolCall { id, tool, args } => {
                                json!({"type": "tool_use", "id": id, "name": tool, "input": args})
                            }
                        })
                        .collect();
                    wire.push(json!({"role": "user", "content": content}));
                }
            }
        }
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, wire)
    }

    fn response_from_wire(wire: WireResponse) -> ModelResponse {
        let parts = wire
            .content
            .into_iter()
            .filter_map(|block| match block {
                WireBlock::Text { text } => Some(Part::Text(text)),
                WireBlock::Thinking { thinking } => Some(Part::Thought(thinking)),
                WireBlock::ToolUse { id, name, input } => Some(Part::ToolCall {
                    id,
                    tool: name,
                    args: input,
                }),
                WireBlock::Unknown => None,
            })
            .collect();
        ModelResponse {
            parts,
            usage: CallUsage {
                prompt_tokens: wire.usage.input_tokens,
                completion_tokens: wire.usage.output_tokens,
                cached_tokens: wire.usage.cache_read_input_tokens,
                cost: 0.0,
            },
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn infer(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let (inline_system, wire_messages) = Self::wire_messages(&request.messages);
        let (_, model_name) = split_model_id(&request.model);
        let body = WireRequest {
            model: model_name,
            max_tokens: request.max_completion_tokens,
            system: request.system.clone().or(inline_system),
            tools: request.tools.clone(),
            messages: wire_messages,
        };

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ModelError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;
        Ok(Self::response_from_wire(wire))
    }
}

/// Default factory: resolves `providers.<id>` wiring from configuration and
/// reads the API key from the configured environment variable.
pub struct HttpClientFactory;

impl ModelClientFactory for HttpClientFactory {
    fn build(&self, model: &str, config: &UserConfig) -> Arc<dyn ModelClient> {
        let (provider, _) = split_model_id(model);
        let wiring = config.providers.get(provider);
        let api_key = wiring
            .and_then(|p| std::env::var(&p.api_key_env).ok())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            warn!(provider, "no API key found for provider");
        }

        Arc::new(AnthropicClient::new(
            api_key,
            wiring.map(|p| p.base_url.clone()),
        ))
    }
}
