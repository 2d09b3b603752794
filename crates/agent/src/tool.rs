use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use tabula_engine::{DatasetProfile, QueryEngine};
use tabula_session::SessionStore;

/// A tool's interface as presented to the LLM (Anthropic tool format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the expected input.
    pub input_schema: Value,
}

/// The LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Invocation id, echoed back in the matching result.
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// What goes back into the LLM context for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: &str, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: message.into(),
            is_error: true,
        }
    }
}

/// Everything a turn needs from its session: the dataset file, the cached
/// profile, and the shared message store. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub file_path: PathBuf,
    pub filename: String,
    pub profile: DatasetProfile,
    pub store: Arc<RwLock<SessionStore>>,
    pub engine: QueryEngine,
}
