//! LLM completion layer.
//!
//! The core talks to providers through the [`LlmClient`] trait and the
//! [`llm_completion`] helper, which layers streaming-with-fallback and
//! retry-with-backoff on top of any client. Tokens stream to the caller
//! through `StreamToken` events on the agent's bus; non-streaming callers
//! receive the same aggregated string.

pub mod providers;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

use crate::events::{AgentEvent, EventBus, EventMeta};

pub use providers::openai::OpenAiCompatibleClient;

/// Notice emitted as a single stream token when streaming fails and the
/// call transparently falls back to a blocking completion.
pub const STREAM_FALLBACK_NOTICE: &str =
    "⚠️ Streaming not supported for this model, falling back to non-streaming.\n";

/// Attempts made for a blocking completion before giving up.
const MAX_COMPLETION_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Provider-boundary errors, categorised for retry decisions.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Context window exceeded: {0}")]
    ContextWindowExceeded(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request rejected by provider policy: {0}")]
    Policy(String),

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Completion failed: {0}")]
    NonRecoverable(String),
}

impl LlmError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit(_)
                | LlmError::Timeout(_)
                | LlmError::Network(_)
                | LlmError::Api(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Request / client trait
// ---------------------------------------------------------------------------

/// A single message of an LLM conversation, in provider wire shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Parameters of one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

/// Stream of response tokens.
pub type TokenStream = BoxStream<'static, Result<String, LlmError>>;

/// The provider boundary. Implementations translate the request into the
/// provider's wire format; they do not retry (the helper does).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Blocking completion returning the full assistant text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// Streaming completion. Default: providers that cannot stream fail
    /// here and let the helper fall back to [`LlmClient::complete`].
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<TokenStream, LlmError> {
        let _ = request;
        Err(LlmError::Api("streaming not supported".into()))
    }
}

// ---------------------------------------------------------------------------
// Completion helper
// ---------------------------------------------------------------------------

/// Event attribution for tokens emitted during a completion.
#[derive(Debug, Clone)]
pub struct CallAttribution {
    pub agent_id: String,
    pub agent_name: String,
    pub step: Option<usize>,
    pub task_id: Option<String>,
}

impl CallAttribution {
    fn stream_token(&self, token: impl Into<String>) -> AgentEvent {
        AgentEvent::StreamToken {
            meta: EventMeta::new(&self.agent_id, &self.agent_name, self.task_id.clone()),
            token: token.into(),
            step_number: self.step,
        }
    }
}

/// Run a completion with streaming fallback and bounded retries.
///
/// Streaming path: every token is emitted as a `StreamToken` event and
/// accumulated into the returned string. Any streaming failure emits one
/// fallback-notice token, then the call retries in blocking mode.
/// Blocking path: up to three attempts with exponential backoff for
/// retriable errors; persistent or non-retriable failure becomes
/// [`LlmError::NonRecoverable`].
pub async fn llm_completion(
    client: &dyn LlmClient,
    request: &CompletionRequest,
    streaming: bool,
    bus: &EventBus,
    attribution: &CallAttribution,
) -> Result<String, LlmError> {
    if streaming {
        match client.complete_stream(request).await {
            Ok(mut stream) => {
                let mut full_response = String::new();
                let mut failed: Option<LlmError> = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(token) => {
                            full_response.push_str(&token);
                            bus.emit(attribution.stream_token(token)).await;
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                match failed {
                    None => return Ok(full_response),
                    Some(e) => {
                        log::warn!(
                            "Streaming failed for model {}: {e}. Falling back to non-streaming.",
                            request.model
                        );
                        bus.emit(attribution.stream_token(STREAM_FALLBACK_NOTICE)).await;
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "Streaming unavailable for model {}: {e}. Falling back to non-streaming.",
                    request.model
                );
                bus.emit(attribution.stream_token(STREAM_FALLBACK_NOTICE)).await;
            }
        }
    }

    let mut last_error: Option<LlmError> = None;
    for attempt in 0..MAX_COMPLETION_ATTEMPTS {
        match client.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retriable() && attempt + 1 < MAX_COMPLETION_ATTEMPTS => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt);
                log::warn!(
                    "Completion attempt {} failed: {e}. Retrying in {delay:?}.",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => {
                last_error = Some(e);
                break;
            }
        }
    }

    let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(LlmError::NonRecoverable(format!(
        "Completion failed with {} after {} attempt(s): {cause}",
        request.model, MAX_COMPLETION_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        error: fn(String) -> LlmError,
    }

    #[async_trait]
    impl LlmClient for Scripted {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)(format!("failure {n}")))
            } else {
                Ok("hello".to_string())
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            temperature: 0.2,
            max_tokens: None,
        }
    }

    fn attribution() -> CallAttribution {
        CallAttribution {
            agent_id: "a".into(),
            agent_name: "n".into(),
            step: Some(1),
            task_id: None,
        }
    }

    #[tokio::test]
    async fn test_retriable_errors_retry_then_succeed() {
        let client = Scripted {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            error: LlmError::RateLimit,
        };
        let bus = EventBus::new();
        let result = llm_completion(&client, &request(), false, &bus, &attribution()).await;
        assert_eq!(result.unwrap(), "hello");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_fails_immediately() {
        let client = Scripted {
            calls: AtomicUsize::new(0),
            fail_first: 10,
            error: LlmError::Authentication,
        };
        let bus = EventBus::new();
        let result = llm_completion(&client, &request(), false, &bus, &attribution()).await;
        assert!(matches!(result, Err(LlmError::NonRecoverable(_))));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_emits_fallback_token() {
        let client = Scripted {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            error: LlmError::Api,
        };
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            Arc::new(crate::events::ChannelObserver::new(tx)),
            vec!["StreamToken".into()],
        );

        let result = llm_completion(&client, &request(), true, &bus, &attribution()).await;
        assert_eq!(result.unwrap(), "hello");

        let event = rx.recv().await.unwrap();
        match event {
            AgentEvent::StreamToken { token, .. } => {
                assert_eq!(token, STREAM_FALLBACK_NOTICE);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
