use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// What a message carries. `Internal` is assistant reasoning: replayed to the
/// LLM on later turns, never shown to the client. `QueryResult` is replayed
/// to the LLM but excluded from restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Table,
    Plot,
    QueryResult,
    Internal,
}

impl MessageKind {
    /// Whether session restore returns this message to the client.
    pub fn restorable(&self) -> bool {
        !matches!(self, Self::QueryResult | Self::Internal)
    }
}

/// One entry in a session's append-only log. Ids are monotonic per session,
/// starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub role: Role,
    pub kind: MessageKind,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_excludes_internal_and_query_results() {
        assert!(MessageKind::Text.restorable());
        assert!(MessageKind::Table.restorable());
        assert!(MessageKind::Plot.restorable());
        assert!(!MessageKind::QueryResult.restorable());
        assert!(!MessageKind::Internal.restorable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&MessageKind::QueryResult).unwrap(),
            "\"query_result\""
        );
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
