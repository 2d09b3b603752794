use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::ChatMessage;
use crate::tool::{ToolCall, ToolDefinition};

/// One LLM request: full context, tool schemas, sampling knobs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The assistant's reply for one iteration: optional reasoning text plus
/// zero or more tool calls.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop: StopReason,
}

impl AssistantTurn {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            stop: StopReason::EndTurn,
        }
    }

    pub fn tool_use(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text,
            tool_calls,
            stop: StopReason::ToolUse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Trait the agent loop drives. Defined here (by the consumer); the concrete
/// Anthropic client lives in the llm crate.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<AssistantTurn, LlmError>;

    /// Provider name for logging ("claude", "mock").
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("authentication failed")]
    Auth,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Scripted provider for tests: plays back queued turns, then falls back to
/// a configurable repeated turn (or a bare end-of-turn).
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct MockProvider {
        queued: Mutex<VecDeque<Result<AssistantTurn, LlmError>>>,
        fallback: Mutex<Option<AssistantTurn>>,
        delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue(&self, turn: AssistantTurn) {
            self.queued.lock().unwrap().push_back(Ok(turn));
        }

        pub fn queue_error(&self, error: LlmError) {
            self.queued.lock().unwrap().push_back(Err(error));
        }

        pub fn queue_text(&self, text: &str) {
            self.queue(AssistantTurn::text_only(text));
        }

        /// Returned for every call once the queue runs dry.
        pub fn set_fallback(&self, turn: AssistantTurn) {
            *self.fallback.lock().unwrap() = Some(turn);
        }

        /// Sleep before answering, to give cancellation a window.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<AssistantTurn, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(next) = self.queued.lock().unwrap().pop_front() {
                return next;
            }
            if let Some(fallback) = self.fallback.lock().unwrap().clone() {
                return Ok(fallback);
            }
            Ok(AssistantTurn {
                text: None,
                tool_calls: Vec::new(),
                stop: StopReason::EndTurn,
            })
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}
