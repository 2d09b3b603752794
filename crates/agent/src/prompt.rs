//! System prompt construction and message-log replay.
//!
//! The data summary is a pure function of the cached profile — no file I/O
//! happens at turn time, and identical profiles always render identically.

use serde_json::Value;

use tabula_engine::DatasetProfile;
use tabula_session::{MessageKind, Role, StoredMessage};

use crate::conversation::{AssistantContent, ChatMessage};

/// Which prompt variant a turn uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFlow {
    /// Auto-analysis right after upload.
    InitialAnalysis,
    /// Conversational follow-up questions.
    FollowUp,
}

/// Synthetic user instruction injected for auto-analysis turns.
pub const AUTO_ANALYZE_INSTRUCTION: &str = "Analyze this dataset.";

const PROMPT_INITIAL: &str = "\
You are a data analyst. The user just uploaded a dataset. Explore it and deliver a concise initial analysis.

{data_summary}

Work in two phases, completing each phase (queries, then output) before starting the next.

Phase 1 — Dataset summary:
1. Run a few sql_query calls to understand the data: sample rows, basic statistics, null counts.
2. Call output_text with a summary. Open with a bold one-liner naming the dataset, its row count and column count, then a short paragraph on the key variables, notable patterns and data quality. Every sentence should carry a concrete number. No bullet points or headers.

Phase 2 — Column dictionary:
3. Run sql_query calls for per-column detail: unique counts, typical values, distributions.
4. Call output_table covering every column with: Column, Type, Non-Null Count, Unique Count, Description, Typical Values, Issues. Flag high null rates, outliers, mixed types and constant columns under Issues; write \"None\" when clean.

Then call finalize with a short descriptive session title (e.g. \"E-commerce Sales Q4 2024\").

Guidelines:
- Keep queries focused — a few per phase, not dozens at once.
- Only SELECT queries are allowed. Never attempt to modify data.";

const PROMPT_FOLLOWUP: &str = "\
You are a data analyst assistant helping the user explore their dataset through conversation.

{data_summary}

Use your tools to answer thoroughly: sql_query to verify with real data before answering, create_plot for distributions, trends and comparisons, output_table for structured results, and output_text for concise narrative. Every claim should carry a concrete number from a query.

Guidelines:
- Don't guess — run a query first.
- If a query fails, read the error, adjust, and retry; don't give up on the first failure.
- If the question is ambiguous, state your interpretation and proceed.
- Call finalize when the question is fully answered (pass null for session_title).

Constraints:
- Only SELECT queries are allowed. Never attempt to modify data.
- Stay on topic: this dataset and data analysis. Politely decline unrelated requests.";

/// Render the system prompt for a flow.
pub fn system_prompt(flow: PromptFlow, filename: &str, profile: &DatasetProfile) -> String {
    let template = match flow {
        PromptFlow::InitialAnalysis => PROMPT_INITIAL,
        PromptFlow::FollowUp => PROMPT_FOLLOWUP,
    };
    template.replace("{data_summary}", &data_summary(filename, profile))
}

/// Deterministic rendering of the dataset profile for the system prompt.
pub fn data_summary(filename: &str, profile: &DatasetProfile) -> String {
    let mut lines = vec![
        "## Dataset".to_string(),
        format!("File: `{filename}`"),
        "Table: `data`".to_string(),
        format!("Rows: {}", profile.row_count),
        format!("Columns ({}):", profile.column_count),
    ];
    for column in &profile.columns {
        let bucket = null_bucket(column.null_count, profile.row_count);
        let mut line = format!("  - {}: {}, nulls: {}", column.name, column.kind.label(), bucket);
        if !column.sample_values.is_empty() {
            let samples: Vec<&str> = column
                .sample_values
                .iter()
                .take(5)
                .map(String::as_str)
                .collect();
            line.push_str(&format!(", e.g. {}", samples.join(", ")));
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn null_bucket(null_count: u64, row_count: u64) -> &'static str {
    if null_count == 0 || row_count == 0 {
        return "none";
    }
    let ratio = null_count as f64 / row_count as f64;
    if ratio < 0.05 {
        "<5%"
    } else if ratio < 0.25 {
        "<25%"
    } else {
        ">=25%"
    }
}

/// Rows of a persisted query result included verbatim in replayed context.
const REPLAY_RESULT_ROWS: usize = 20;

/// Replay the persisted message log into LLM context.
///
/// User messages pass through unchanged. `internal` reasoning is restored
/// verbatim as assistant text. A `query_result` is flattened to a brief
/// textual form and appended to the immediately preceding assistant message.
/// Other visible outputs become bracketed assistant summaries so the agent
/// knows what the user has already seen.
pub fn replay(messages: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut replayed: Vec<ChatMessage> = Vec::new();

    for message in messages {
        match (message.role, message.kind) {
            (Role::User, _) => replayed.push(ChatMessage::User(message.body.clone())),
            (Role::Assistant, MessageKind::Internal) => {
                push_assistant_text(&mut replayed, message.body.clone());
            }
            (Role::Assistant, MessageKind::QueryResult) => {
                append_to_previous_assistant(&mut replayed, flatten_query_result(message));
            }
            (Role::Assistant, MessageKind::Text) => {
                push_assistant_text(&mut replayed, message.body.clone());
            }
            (Role::Assistant, MessageKind::Table) => {
                push_assistant_text(&mut replayed, format!("[Table output]: {}", message.body));
            }
            (Role::Assistant, MessageKind::Plot) => {
                push_assistant_text(&mut replayed, format!("[Plot output]: {}", message.body));
            }
            (Role::System, _) => {}
        }
    }

    replayed
}

fn push_assistant_text(replayed: &mut Vec<ChatMessage>, text: String) {
    replayed.push(ChatMessage::Assistant(AssistantContent::text_only(text)));
}

/// Append to the last assistant message, or start one if the log begins with
/// a query result (possible after truncation at the store level).
fn append_to_previous_assistant(replayed: &mut Vec<ChatMessage>, text: String) {
    if let Some(ChatMessage::Assistant(content)) = replayed.last_mut() {
        match &mut content.text {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(&text);
            }
            None => content.text = Some(text),
        }
    } else {
        push_assistant_text(replayed, text);
    }
}

fn flatten_query_result(message: &StoredMessage) -> String {
    let Some(payload) = &message.payload else {
        return format!("[Query result]: {}", message.body);
    };
    let query = payload.get("query").and_then(Value::as_str).unwrap_or("");
    let rows = payload
        .get("rows")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let shown: Vec<&Value> = rows.iter().take(REPLAY_RESULT_ROWS).collect();
    format!(
        "[SQL query: {query}]\n[Result: {} rows returned]\n{}",
        rows.len(),
        serde_json::to_string(&shown).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tabula_engine::{ColumnKind, ColumnProfile};

    fn profile() -> DatasetProfile {
        DatasetProfile {
            row_count: 1000,
            column_count: 2,
            columns: vec![
                ColumnProfile {
                    name: "id".into(),
                    kind: ColumnKind::Integer,
                    null_count: 0,
                    unique_count: 1000,
                    sample_values: vec!["1".into(), "2".into()],
                },
                ColumnProfile {
                    name: "age".into(),
                    kind: ColumnKind::Integer,
                    null_count: 300,
                    unique_count: 60,
                    sample_values: vec!["34".into()],
                },
            ],
            preview: vec![],
        }
    }

    fn stored(id: u64, role: Role, kind: MessageKind, body: &str, payload: Option<Value>) -> StoredMessage {
        StoredMessage {
            id,
            role,
            kind,
            body: body.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn data_summary_is_deterministic() {
        let a = data_summary("sales.csv", &profile());
        let b = data_summary("sales.csv", &profile());
        assert_eq!(a, b);
        assert!(a.contains("Rows: 1000"));
        assert!(a.contains("id: integer, nulls: none, e.g. 1, 2"));
        assert!(a.contains("age: integer, nulls: >=25%"));
    }

    #[test]
    fn null_buckets() {
        assert_eq!(null_bucket(0, 100), "none");
        assert_eq!(null_bucket(4, 100), "<5%");
        assert_eq!(null_bucket(24, 100), "<25%");
        assert_eq!(null_bucket(25, 100), ">=25%");
    }

    #[test]
    fn prompts_differ_by_flow_but_share_the_summary() {
        let initial = system_prompt(PromptFlow::InitialAnalysis, "t.csv", &profile());
        let followup = system_prompt(PromptFlow::FollowUp, "t.csv", &profile());
        assert_ne!(initial, followup);
        assert!(initial.contains("Rows: 1000"));
        assert!(followup.contains("Rows: 1000"));
        assert!(!initial.contains("{data_summary}"));
    }

    #[test]
    fn replay_passes_user_and_internal_through() {
        let log = vec![
            stored(1, Role::User, MessageKind::Text, "hi", None),
            stored(2, Role::Assistant, MessageKind::Internal, "let me check", None),
            stored(3, Role::Assistant, MessageKind::Text, "hello", None),
        ];
        let replayed = replay(&log);
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0], ChatMessage::User("hi".into()));
        assert!(matches!(
            &replayed[1],
            ChatMessage::Assistant(c) if c.text.as_deref() == Some("let me check")
        ));
    }

    #[test]
    fn query_results_fold_into_the_preceding_assistant_message() {
        let payload = json!({"query": "SELECT count(*) FROM data", "rows": [[1000]], "columns": ["count"]});
        let log = vec![
            stored(1, Role::User, MessageKind::Text, "how many rows?", None),
            stored(2, Role::Assistant, MessageKind::Internal, "counting", None),
            stored(3, Role::Assistant, MessageKind::QueryResult, "Counting rows...", Some(payload)),
        ];
        let replayed = replay(&log);
        assert_eq!(replayed.len(), 2);
        match &replayed[1] {
            ChatMessage::Assistant(content) => {
                let text = content.text.as_deref().unwrap();
                assert!(text.starts_with("counting"));
                assert!(text.contains("SELECT count(*) FROM data"));
                assert!(text.contains("1 rows returned"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn leading_query_result_still_replays() {
        let log = vec![stored(
            1,
            Role::Assistant,
            MessageKind::QueryResult,
            "orphan",
            None,
        )];
        let replayed = replay(&log);
        assert_eq!(replayed.len(), 1);
    }
}
