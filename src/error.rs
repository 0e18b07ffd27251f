use std::time::Duration;

/// Errors that cross the orchestrator boundary. Tool failures and
/// authorization denials never appear here: they become `ToolReturn`
/// content and the request keeps going.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("request aborted by user")]
    UserAbort,
    #[error("request timed out after {0:?}")]
    GlobalRequestTimeout(Duration),
    #[error("malformed tool call from model: {0}")]
    ToolBatchingParse(String),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model transport failed: {0}")]
    Request(String),
    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("could not decode model response: {0}")]
    Parse(String),
    #[error("streaming not supported by this client")]
    StreamUnsupported,
}

impl ModelError {
    /// Whether a retry within `max_retries` is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request(_) => true,
            ModelError::Api { status, .. } => *status == 429 || *status >= 500,
            ModelError::Parse(_) | ModelError::StreamUnsupported => false,
        }
    }
}

/// Error from a single tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}
