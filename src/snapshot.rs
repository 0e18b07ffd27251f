//! Optional conversation persistence. The core never writes a snapshot on
//! its own; hosts call `Session::save_snapshot` when they want one.
//!
//! The bundled store writes a JSONL trace: a header record followed by one
//! line per message. Line-per-message means a crash mid-write costs at most
//! the trailing line, and the trace doubles as an export hosts can feed to
//! other tooling.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;
use crate::message::{Message, MessageStore};

/// Point-in-time copy of the conversation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub messages: MessageStore,
    pub current_model: String,
    pub total_tokens: u64,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, session_id: &str, snapshot: &SessionSnapshot) -> Result<(), CoreError>;

    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CoreError>;
}

/// Bumped whenever the trace layout changes; a mismatched trace is refused
/// rather than half-read.
const TRACE_VERSION: u32 = 1;

/// First line of every trace file.
#[derive(Serialize, Deserialize)]
struct TraceHeader {
    version: u32,
    model: String,
    total_tokens: u64,
    saved_at: chrono::DateTime<chrono::Utc>,
}

/// One `<session_id>.jsonl` trace per session.
pub struct JsonlSnapshotStore {
    dir: PathBuf,
}

impl JsonlSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn trace_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    fn render(snapshot: &SessionSnapshot) -> Result<String, CoreError> {
        let header = TraceHeader {
            version: TRACE_VERSION,
            model: snapshot.current_model.clone(),
            total_tokens: snapshot.total_tokens,
            saved_at: snapshot.saved_at,
        };
        let mut trace = serde_json::to_string(&header)
            .map_err(|e| CoreError::Snapshot(format!("encoding trace header: {e}")))?;
        trace.push('\n');
        for message in snapshot.messages.messages() {
            let line = serde_json::to_string(message)
                .map_err(|e| CoreError::Snapshot(format!("encoding message: {e}")))?;
            trace.push_str(&line);
            trace.push('\n');
        }
        Ok(trace)
    }

    /// Replay message lines into a fresh store, stopping at the first line
    /// that does not parse. A torn trailing line from an interrupted write
    /// loses that one message, not the session.
    fn replay<'a>(lines: impl Iterator<Item = &'a str>) -> MessageStore {
        let mut messages = MessageStore::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.append(message),
                Err(e) => {
                    warn!(
                        replayed = messages.len(),
                        error = %e,
                        "trace ends in an unreadable line, keeping messages before it"
                    );
                    break;
                }
            }
        }
        messages
    }
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    async fn save(&self, session_id: &str, snapshot: &SessionSnapshot) -> Result<(), CoreError> {
        let trace = Self::render(snapshot)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::Snapshot(format!("creating snapshot dir: {e}")))?;
        tokio::fs::write(self.trace_path(session_id), trace)
            .await
            .map_err(|e| CoreError::Snapshot(format!("writing trace: {e}")))
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CoreError> {
        let text = match tokio::fs::read_to_string(self.trace_path(session_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Snapshot(format!("reading trace: {e}"))),
        };

        let mut lines = text.lines();
        let Some(first) = lines.next() else {
            return Ok(None);
        };
        let header: TraceHeader = serde_json::from_str(first)
            .map_err(|e| CoreError::Snapshot(format!("bad trace header: {e}")))?;
        if header.version != TRACE_VERSION {
            return Err(CoreError::Snapshot(format!(
                "unsupported trace version {}",
                header.version
            )));
        }

        Ok(Some(SessionSnapshot {
            messages: Self::replay(lines),
            current_model: header.model,
            total_tokens: header.total_tokens,
            saved_at: header.saved_at,
        }))
    }
}
