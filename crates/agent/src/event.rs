use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-facing events streamed over the transport. Serializes to the wire
/// envelope `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Advisory progress hint; droppable under backpressure.
    Status { message: String },
    /// Markdown body for the user.
    Text { text: String },
    Table {
        title: String,
        headers: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Plot {
        title: String,
        /// Opaque chart specification, passed through to the client.
        spec: Value,
    },
    QueryResult {
        description: String,
        sql: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        row_count: usize,
        truncated: bool,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionUpdate { title: String },
    Error { message: String },
    /// Terminal event, exactly one per turn.
    Done {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        aborted: bool,
        data_updated: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        suggestions: Vec<String>,
        /// Set when the iteration cap ended the turn before `finalize`.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        incomplete: bool,
    },
}

impl AgentEvent {
    pub fn done() -> Self {
        Self::Done {
            aborted: false,
            data_updated: false,
            suggestions: Vec::new(),
            incomplete: false,
        }
    }

    pub fn done_aborted() -> Self {
        Self::Done {
            aborted: true,
            data_updated: false,
            suggestions: Vec::new(),
            incomplete: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether the event is user-visible output (as opposed to advisory or
    /// terminal bookkeeping).
    pub fn is_visible_output(&self) -> bool {
        matches!(
            self,
            Self::Text { .. } | Self::Table { .. } | Self::Plot { .. }
        )
    }
}
