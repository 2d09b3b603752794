//! Anthropic Messages API implementation of [`LlmProvider`].
//!
//! One POST per loop iteration; the reply's content blocks are translated
//! into the provider-agnostic [`AssistantTurn`]. Per-request timeouts and
//! retries belong to the agent loop, not this client.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tabula_agent::conversation::ChatMessage;
use tabula_agent::provider::{AssistantTurn, CompletionRequest, LlmError, LlmProvider, StopReason};
use tabula_agent::tool::{ToolCall, ToolDefinition};
use tabula_core::config::LlmConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        }
    }

    /// Build from config. None when no API key is set — the server runs
    /// without chat in that case.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
        ))
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<AssistantTurn, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);

        let messages: Vec<Value> = request.messages.iter().map(message_to_api).collect();
        let tools: Vec<Value> = request.tools.iter().map(tool_to_api).collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, messages = request.messages.len(), "claude request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body_text = response.text().await.unwrap_or_default();
            if status == 401 {
                return Err(LlmError::Auth);
            }
            if status == 429 {
                let retry_after = serde_json::from_str::<Value>(&body_text)
                    .ok()
                    .and_then(|v| v["error"]["retry_after_secs"].as_u64())
                    .unwrap_or(30);
                return Err(LlmError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }
            return Err(LlmError::Api {
                status,
                message: body_text,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_response(&value)
    }

    fn provider_name(&self) -> &str {
        "claude"
    }
}

/// Translate a [`ToolDefinition`] into the API tool shape.
fn tool_to_api(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// Translate one conversation message into an API message object. Tool
/// results ride in a user message, one `tool_result` block per call.
fn message_to_api(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::User(text) => json!({
            "role": "user",
            "content": text,
        }),
        ChatMessage::Assistant(content) => {
            let mut blocks: Vec<Value> = Vec::new();
            if let Some(text) = &content.text {
                blocks.push(json!({"type": "text", "text": text}));
            }
            for call in &content.tool_calls {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            json!({
                "role": "assistant",
                "content": blocks,
            })
        }
        ChatMessage::ToolResults(results) => {
            let blocks: Vec<Value> = results
                .iter()
                .map(|result| {
                    json!({
                        "type": "tool_result",
                        "tool_use_id": result.tool_call_id,
                        "content": result.content,
                        "is_error": result.is_error,
                    })
                })
                .collect();
            json!({
                "role": "user",
                "content": blocks,
            })
        }
    }
}

/// Translate an API response body into an [`AssistantTurn`].
fn parse_response(value: &Value) -> Result<AssistantTurn, LlmError> {
    let content = value["content"]
        .as_array()
        .ok_or_else(|| LlmError::InvalidResponse("missing content array".into()))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    text_parts.push(text.to_string());
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    input: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    let stop = match value["stop_reason"].as_str() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };

    let text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };

    Ok(AssistantTurn {
        text,
        tool_calls,
        stop,
    })
}
