use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::tokens::estimate_tokens;

/// An element within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    Thought(String),
    ToolCall {
        id: String,
        tool: String,
        args: Value,
    },
    ToolReturn {
        id: String,
        tool: String,
        content: String,
        pruned: bool,
    },
}

/// An ordered record in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    UserPrompt { text: String },
    SystemPrompt { text: String },
    ModelRequest { parts: Vec<Part> },
    ModelResponse { parts: Vec<Part> },
}

/// Location of a `ToolReturn` part, for compaction scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolReturnLoc {
    pub message_index: usize,
    pub part_index: usize,
}

/// The conversation log. Append-only, except for the three mutations the
/// orchestrator is allowed to make: tool-return pruning, synthetic
/// intervention messages, and orphan patching.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user_prompt(&mut self, text: impl Into<String>) {
        self.append(Message::UserPrompt { text: text.into() });
    }

    pub fn push_system_prompt(&mut self, text: impl Into<String>) {
        self.append(Message::SystemPrompt { text: text.into() });
    }

    /// Append a tool return, merging into the trailing model-request message
    /// when it is already a tool-return batch. Keeps one wire message per
    /// node's worth of returns.
    pub fn push_tool_return(&mut self, id: impl Into<String>, tool: impl Into<String>, content: impl Into<String>) {
        let part = Part::ToolReturn {
            id: id.into(),
            tool: tool.into(),
            content: content.into(),
            pruned: false,
        };
        if let Some(Message::ModelRequest { parts }) = self.messages.last_mut() {
            if parts.iter().all(|p| matches!(p, Part::ToolReturn { .. })) {
                parts.push(part);
                return;
            }
        }
        self.append(Message::ModelRequest { parts: vec![part] });
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn user_turn_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::UserPrompt { .. }))
            .count()
    }

    /// Concatenated text parts of the most recent model response.
    pub fn last_response_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::ModelResponse { parts } => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                Some(text.join("\n"))
            }
            _ => None,
        })
    }

    /// Tool-return part locations, newest first.
    pub fn iter_tool_returns_reverse(&self) -> impl Iterator<Item = ToolReturnLoc> + '_ {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(message_index, m)| {
                let parts: &[Part] = match m {
                    Message::ModelRequest { parts } | Message::ModelResponse { parts } => parts,
                    _ => &[],
                };
                parts
                    .iter()
                    .enumerate()
                    .rev()
                    .filter_map(move |(part_index, p)| match p {
                        Part::ToolReturn { .. } => Some(ToolReturnLoc {
                            message_index,
                            part_index,
                        }),
                        _ => None,
                    })
            })
    }

    pub fn part(&self, loc: ToolReturnLoc) -> Option<&Part> {
        let parts = match self.messages.get(loc.message_index)? {
            Message::ModelRequest { parts } | Message::ModelResponse { parts } => parts,
            _ => return None,
        };
        parts.get(loc.part_index)
    }

    /// Replace a `ToolReturn`'s content with the placeholder. Returns the
    /// number of reclaimed tokens; 0 (and no change) if the part is already
    /// pruned or is not a tool return.
    pub fn prune_part(&mut self, loc: ToolReturnLoc, placeholder: &str, model: &str) -> u64 {
        let parts = match self.messages.get_mut(loc.message_index) {
            Some(Message::ModelRequest { parts }) | Some(Message::ModelResponse { parts }) => parts,
            _ => return 0,
        };
        match parts.get_mut(loc.part_index) {
            Some(Part::ToolReturn { content, pruned, .. }) => {
                if *pruned {
                    return 0;
                }
                let reclaimed = estimate_tokens(content, model)
                    .saturating_sub(estimate_tokens(placeholder, model));
                *content = placeholder.to_string();
                *pruned = true;
                reclaimed
            }
            _ => 0,
        }
    }

    /// Ids of tool calls that have no matching tool return yet, in call order.
    pub fn orphaned_tool_calls(&self) -> Vec<(String, String)> {
        let mut returned: Vec<&str> = Vec::new();
        for m in &self.messages {
            let parts: &[Part] = match m {
                Message::ModelRequest { parts } | Message::ModelResponse { parts } => parts,
                _ => continue,
            };
            for p in parts {
                if let Part::ToolReturn { id, .. } = p {
                    returned.push(id);
                }
            }
        }
        let mut orphans = Vec::new();
        for m in &self.messages {
            let parts: &[Part] = match m {
                Message::ModelRequest { parts } | Message::ModelResponse { parts } => parts,
                _ => continue,
            };
            for p in parts {
                if let Part::ToolCall { id, tool, .. } = p {
                    if !returned.contains(&id.as_str()) {
                        orphans.push((id.clone(), tool.clone()));
                    }
                }
            }
        }
        orphans
    }

    /// Synthesize tool returns for every orphaned tool call so the log stays
    /// invariant-clean across abort and error paths. Returns how many were
    /// patched.
    pub fn patch_orphaned(&mut self, reason: &str) -> usize {
        let orphans = self.orphaned_tool_calls();
        if orphans.is_empty() {
            return 0;
        }
        debug!(count = orphans.len(), reason, "patching orphaned tool calls");
        let parts = orphans
            .iter()
            .map(|(id, tool)| Part::ToolReturn {
                id: id.clone(),
                tool: tool.clone(),
                content: format!("Tool '{tool}' was not completed: {reason}"),
                pruned: false,
            })
            .collect();
        self.append(Message::ModelRequest { parts });
        orphans.len()
    }

    /// Sum of token estimates over every part in the log.
    pub fn total_token_estimate(&self, model: &str) -> u64 {
        self.messages
            .iter()
            .map(|m| match m {
                Message::UserPrompt { text } | Message::SystemPrompt { text } => {
                    estimate_tokens(text, model)
                }
                Message::ModelRequest { parts } | Message::ModelResponse { parts } => parts
                    .iter()
                    .map(|p| match p {
                        Part::Text(s) | Part::Thought(s) => estimate_tokens(s, model),
                        Part::ToolCall { args, .. } => {
                            estimate_tokens(&args.to_string(), model)
                        }
                        Part::ToolReturn { content, .. } => estimate_tokens(content, model),
                    })
                    .sum(),
            })
            .sum()
    }
}
