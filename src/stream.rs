//! Streaming consumption of a model node. Runs inside the request's
//! cancellation scope, coalesces UI updates, and degrades to a plain
//! non-streaming call when the stream is unavailable or breaks mid-way.
//! There is no inner watchdog here; the orchestrator's global request
//! timeout is the only timer.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::Agent;
use crate::error::{CoreError, ModelError};
use crate::events::UiHooks;
use crate::model::{ModelRequest, ModelResponse, StreamEvent};

/// Minimum interval between `on_stream_token` calls.
pub const STREAM_THROTTLE_MS: u64 = 100;

pub struct Streamer {
    throttle: Duration,
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Streamer {
    pub fn new() -> Self {
        Self {
            throttle: Duration::from_millis(STREAM_THROTTLE_MS),
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Run one node, streaming when the client supports it. The accumulated
    /// text is forwarded through `hooks.on_stream_token`, throttled, with
    /// the final state always delivered.
    pub async fn run_node(
        &self,
        agent: &Agent,
        request: ModelRequest,
        hooks: &dyn UiHooks,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, CoreError> {
        match agent.client().infer_stream(request.clone()).await {
            Ok(mut stream) => {
                let mut partial = String::new();
                let mut last_emit: Option<Instant> = None;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::UserAbort),
                        next = stream.next() => match next {
                            Some(Ok(StreamEvent::TextDelta(delta))) => {
                                partial.push_str(&delta);
                                let due = last_emit
                                    .map_or(true, |t| t.elapsed() >= self.throttle);
                                if due {
                                    hooks.on_stream_token(&partial).await;
                                    last_emit = Some(Instant::now());
                                }
                            }
                            Some(Ok(StreamEvent::Completed(response))) => {
                                if !partial.is_empty() {
                                    hooks.on_stream_token(&partial).await;
                                }
                                return Ok(response);
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "stream failed, falling back to non-streaming");
                                break;
                            }
                            None => {
                                warn!("stream ended without a completed response, falling back");
                                break;
                            }
                        }
                    }
                }
            }
            Err(ModelError::StreamUnsupported) => {}
            Err(e) => {
                warn!(error = %e, "could not open stream, falling back to non-streaming");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::UserAbort),
            result = agent.infer_with_retry(request) => Ok(result?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Part;
    use crate::model::{ModelClient, TokenStream};
    use crate::session::UserConfig;
    use crate::tokens::CallUsage;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    struct RecordingHooks {
        partials: StdMutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn new() -> Self {
            Self { partials: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl UiHooks for RecordingHooks {
        async fn on_stream_token(&self, partial_text: &str) {
            self.partials.lock().unwrap().push(partial_text.to_string());
        }
    }

    fn final_response(text: &str) -> ModelResponse {
        ModelResponse {
            parts: vec![Part::Text(text.into())],
            usage: CallUsage::default(),
        }
    }

    /// Streams scripted events; `infer` counts fallback calls.
    struct ScriptedStreamClient {
        events: StdMutex<Option<Vec<Result<StreamEvent, ModelError>>>>,
        fallback_calls: AtomicUsize,
    }

    impl ScriptedStreamClient {
        fn new(events: Vec<Result<StreamEvent, ModelError>>) -> Self {
            Self {
                events: StdMutex::new(Some(events)),
                fallback_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedStreamClient {
        async fn infer(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
            Ok(final_response("from fallback"))
        }

        async fn infer_stream(&self, _request: ModelRequest) -> Result<TokenStream, ModelError> {
            match self.events.lock().unwrap().take() {
                Some(events) => Ok(stream::iter(events).boxed()),
                None => Err(ModelError::StreamUnsupported),
            }
        }
    }

    fn agent_for(client: Arc<dyn ModelClient>) -> Agent {
        Agent::new("test:model", client, vec![], &UserConfig::default())
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "test:model".into(),
            max_completion_tokens: 64,
            system: None,
            tools: vec![],
            messages: vec![],
        }
    }

    #[tokio::test]
    async fn unthrottled_stream_forwards_every_delta() {
        let client = Arc::new(ScriptedStreamClient::new(vec![
            Ok(StreamEvent::TextDelta("Hel".into())),
            Ok(StreamEvent::TextDelta("lo".into())),
            Ok(StreamEvent::Completed(final_response("Hello"))),
        ]));
        let agent = agent_for(client.clone());
        let hooks = RecordingHooks::new();
        let streamer = Streamer::new().with_throttle(Duration::ZERO);

        let response = streamer
            .run_node(&agent, request(), &hooks, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "Hello");

        let partials = hooks.partials.lock().unwrap().clone();
        // Two deltas plus the final state.
        assert_eq!(partials, vec!["Hel", "Hello", "Hello"]);
        assert_eq!(client.fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn throttle_coalesces_but_always_emits_final() {
        let client = Arc::new(ScriptedStreamClient::new(vec![
            Ok(StreamEvent::TextDelta("a".into())),
            Ok(StreamEvent::TextDelta("b".into())),
            Ok(StreamEvent::TextDelta("c".into())),
            Ok(StreamEvent::TextDelta("d".into())),
            Ok(StreamEvent::Completed(final_response("abcd"))),
        ]));
        let agent = agent_for(client);
        let hooks = RecordingHooks::new();
        // Deltas arrive back-to-back, far inside one throttle window.
        let streamer = Streamer::new();

        streamer
            .run_node(&agent, request(), &hooks, &CancellationToken::new())
            .await
            .unwrap();

        let partials = hooks.partials.lock().unwrap().clone();
        assert_eq!(partials.first().unwrap(), "a");
        assert_eq!(partials.last().unwrap(), "abcd");
        assert!(partials.len() < 5, "updates were not coalesced: {partials:?}");
    }

    #[tokio::test]
    async fn stream_error_falls_back_to_plain_inference() {
        let client = Arc::new(ScriptedStreamClient::new(vec![
            Ok(StreamEvent::TextDelta("par".into())),
            Err(ModelError::Request("connection dropped".into())),
        ]));
        let agent = agent_for(client.clone());
        let hooks = RecordingHooks::new();

        let response = Streamer::new()
            .run_node(&agent, request(), &hooks, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "from fallback");
        assert_eq!(client.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_stream_is_a_silent_fallback() {
        struct PlainClient;

        #[async_trait]
        impl ModelClient for PlainClient {
            async fn infer(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
                Ok(final_response("plain"))
            }
        }

        let agent = agent_for(Arc::new(PlainClient));
        let response = Streamer::new()
            .run_node(&agent, request(), &RecordingHooks::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "plain");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_stream() {
        // A stream that never completes.
        struct StuckClient;

        #[async_trait]
        impl ModelClient for StuckClient {
            async fn infer(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
                futures::future::pending().await
            }

            async fn infer_stream(&self, _request: ModelRequest) -> Result<TokenStream, ModelError> {
                Ok(stream::pending().boxed())
            }
        }

        let agent = agent_for(Arc::new(StuckClient));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let err = Streamer::new()
            .run_node(&agent, request(), &RecordingHooks::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UserAbort));
    }
}
