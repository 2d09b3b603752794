//! The bounded tool-calling loop that drives one turn.
//!
//! Flow: replay log → LLM request → dispatch tool calls → repeat, until
//! `finalize`, the iteration cap, cancellation, the turn deadline, or a
//! terminal LLM failure. Whatever happens, exactly one `done` goes out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tabula_core::config::LimitsConfig;
use tabula_session::{MessageKind, Role};

use crate::conversation::{AssistantContent, Conversation};
use crate::event::AgentEvent;
use crate::prompt::{self, PromptFlow};
use crate::provider::{AssistantTurn, CompletionRequest, LlmError, LlmProvider};
use crate::sink::EventSink;
use crate::tool::{SessionHandle, ToolCall, ToolResult};
use crate::tools::{self, CreatePlotArgs, FinalizeArgs, OutputTableArgs, OutputTextArgs,
    SqlQueryArgs, ToolInvocation};

const MAX_LLM_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// What started the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTrigger {
    /// A client chat message. The session runtime persists it before the
    /// loop starts, so it reaches the LLM through log replay.
    UserMessage(String),
    /// Post-upload auto-analysis; injects a synthetic instruction instead.
    AutoAnalyze,
}

/// How the turn ended. Informational — every variant has emitted `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent called `finalize`.
    Finalized,
    /// The LLM stopped without a tool call; treated as finalize with no title.
    EndTurn,
    /// The iteration cap ended the turn; `done` carries the incomplete flag.
    IterationCapped,
    /// Cancellation was observed.
    Aborted,
    /// LLM failure after retries, turn deadline, or an unreadable log.
    Failed,
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    limits: LimitsConfig,
    temperature: f32,
    max_tokens: u32,
}

enum DispatchEffect {
    None,
    Finalized { suggestions: Vec<String> },
}

enum RequestFailure {
    Cancelled,
    Llm(LlmError),
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn LlmProvider>, limits: LimitsConfig) -> Self {
        Self {
            provider,
            limits,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Run a single turn. Cancellation is observed before every LLM request
    /// and before every tool dispatch; once observed, nothing but the final
    /// `done {aborted}` is emitted.
    pub async fn run(
        &self,
        handle: &SessionHandle,
        trigger: TurnTrigger,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let deadline = Instant::now() + Duration::from_secs(self.limits.max_turn_seconds);
        sink.status("Thinking...");

        let flow = match trigger {
            TurnTrigger::AutoAnalyze => PromptFlow::InitialAnalysis,
            TurnTrigger::UserMessage(_) => PromptFlow::FollowUp,
        };
        let system = prompt::system_prompt(flow, &handle.filename, &handle.profile);

        let stored = {
            let store = handle.store.read().await;
            store.messages(&handle.session_id)
        };
        let stored = match stored {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session = %handle.session_id, error = %e, "failed to read message log");
                sink.emit(AgentEvent::error(format!("failed to load conversation: {e}")))
                    .await;
                sink.done(AgentEvent::done()).await;
                return TurnOutcome::Failed;
            }
        };

        let mut conversation = Conversation::new(system, self.limits.context_token_budget);
        for message in prompt::replay(&stored) {
            conversation.push(message);
        }
        if flow == PromptFlow::InitialAnalysis {
            conversation.push_user(prompt::AUTO_ANALYZE_INSTRUCTION);
        }

        let mut suggestions = Vec::new();
        let mut outcome = TurnOutcome::IterationCapped;

        'turn: for iteration in 0..self.limits.max_iterations {
            if cancel.is_cancelled() {
                return self.abort(sink).await;
            }
            if Instant::now() >= deadline {
                return self.expire(sink).await;
            }
            sink.status("Thinking...");

            let turn = match self.request_with_retry(&conversation, cancel).await {
                Ok(turn) => turn,
                Err(RequestFailure::Cancelled) => return self.abort(sink).await,
                Err(RequestFailure::Llm(e)) => {
                    warn!(session = %handle.session_id, error = %e, "llm request failed terminally");
                    sink.emit(AgentEvent::error(format!("assistant unavailable: {e}")))
                        .await;
                    sink.done(AgentEvent::done()).await;
                    return TurnOutcome::Failed;
                }
            };
            debug!(
                iteration,
                tool_calls = turn.tool_calls.len(),
                has_text = turn.text.is_some(),
                "llm responded"
            );

            // Reasoning text is kept for later turns but never streamed live.
            if let Some(text) = turn.text.as_deref() {
                if !text.trim().is_empty() {
                    self.persist(handle, Role::Assistant, MessageKind::Internal, text, None)
                        .await;
                }
            }

            if turn.tool_calls.is_empty() {
                outcome = TurnOutcome::EndTurn;
                break 'turn;
            }

            conversation.push_assistant(AssistantContent {
                text: turn.text.clone(),
                tool_calls: turn.tool_calls.clone(),
            });

            let mut results = Vec::with_capacity(turn.tool_calls.len());
            let mut finalized = false;
            for call in &turn.tool_calls {
                if cancel.is_cancelled() {
                    return self.abort(sink).await;
                }
                // None means cancellation was observed inside the tool; its
                // result must not be emitted.
                let Some((result, effect)) = self.dispatch(call, handle, sink, cancel).await else {
                    return self.abort(sink).await;
                };
                results.push(result);
                if let DispatchEffect::Finalized { suggestions: s } = effect {
                    finalized = true;
                    suggestions = s;
                }
            }
            conversation.push_tool_results(results);

            if finalized {
                outcome = TurnOutcome::Finalized;
                break 'turn;
            }
        }

        // Safety net: a turn must leave the user with something to read.
        if !sink.visible_emitted() {
            let apology =
                "I wasn't able to produce an answer this time. Please try rephrasing your question.";
            sink.emit(AgentEvent::Text {
                text: apology.to_string(),
            })
            .await;
            self.persist(handle, Role::Assistant, MessageKind::Text, apology, None)
                .await;
        }

        if outcome == TurnOutcome::IterationCapped {
            info!(session = %handle.session_id, "iteration cap reached without finalize");
        }
        sink.done(AgentEvent::Done {
            aborted: false,
            data_updated: false,
            suggestions,
            incomplete: outcome == TurnOutcome::IterationCapped,
        })
        .await;
        outcome
    }

    async fn abort(&self, sink: &EventSink) -> TurnOutcome {
        sink.done(AgentEvent::done_aborted()).await;
        TurnOutcome::Aborted
    }

    async fn expire(&self, sink: &EventSink) -> TurnOutcome {
        sink.emit(AgentEvent::error(format!(
            "turn exceeded the {}s limit",
            self.limits.max_turn_seconds
        )))
        .await;
        sink.done(AgentEvent::done()).await;
        TurnOutcome::Failed
    }

    /// One LLM request with per-attempt timeout and full-jitter exponential
    /// backoff on transient failures. At most one request is in flight.
    async fn request_with_retry(
        &self,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> Result<AssistantTurn, RequestFailure> {
        let attempt_timeout = Duration::from_secs(self.limits.llm_timeout_seconds);
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_LLM_ATTEMPTS {
            if attempt > 0 {
                let ceiling = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                let delay =
                    Duration::from_millis(rand::rng().random_range(0..=ceiling.as_millis() as u64));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RequestFailure::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = CompletionRequest {
                system: conversation.system_prompt().to_string(),
                messages: conversation.messages().to_vec(),
                tools: tools::definitions(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(RequestFailure::Cancelled),
                result = tokio::time::timeout(attempt_timeout, self.provider.complete(request)) => {
                    match result {
                        Ok(Ok(turn)) => return Ok(turn),
                        Ok(Err(e)) if e.is_transient() => {
                            warn!(attempt, error = %e, "transient llm error, retrying");
                            last_error = Some(e);
                        }
                        Ok(Err(e)) => return Err(RequestFailure::Llm(e)),
                        Err(_) => {
                            warn!(attempt, "llm request timed out");
                            last_error = Some(LlmError::Network(format!(
                                "request timed out after {}s",
                                self.limits.llm_timeout_seconds
                            )));
                        }
                    }
                }
            }
        }

        Err(RequestFailure::Llm(last_error.unwrap_or_else(|| {
            LlmError::Network("retries exhausted".into())
        })))
    }

    /// Execute one tool call. Returns None when cancellation was observed
    /// while the tool was running — the caller unwinds to Aborted and the
    /// tool's result is never emitted.
    async fn dispatch(
        &self,
        call: &ToolCall,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Option<(ToolResult, DispatchEffect)> {
        let invocation = match ToolInvocation::parse(&call.name, call.input.clone()) {
            Ok(invocation) => invocation,
            Err(message) => {
                warn!(tool = %call.name, %message, "tool arguments rejected");
                return Some((ToolResult::error(&call.id, message), DispatchEffect::None));
            }
        };

        Some(match invocation {
            ToolInvocation::Unknown { name } => {
                warn!(tool = %name, "unknown tool requested");
                (
                    ToolResult::error(&call.id, format!("unknown tool: {name}")),
                    DispatchEffect::None,
                )
            }
            ToolInvocation::SqlQuery(args) => {
                return self.run_sql_query(call, args, handle, sink, cancel).await
            }
            ToolInvocation::OutputText(args) => self.run_output_text(call, args, handle, sink).await,
            ToolInvocation::OutputTable(args) => {
                self.run_output_table(call, args, handle, sink).await
            }
            ToolInvocation::CreatePlot(args) => self.run_create_plot(call, args, handle, sink).await,
            ToolInvocation::Finalize(args) => self.run_finalize(call, args, handle, sink).await,
        })
    }

    async fn run_sql_query(
        &self,
        call: &ToolCall,
        args: SqlQueryArgs,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Option<(ToolResult, DispatchEffect)> {
        sink.status(&args.description);

        // The engine enforces its own timeout; cancellation drops the query
        // future here, best-effort.
        let executed = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = handle
                .engine
                .execute(&handle.file_path, &args.sql, self.limits.max_result_rows) => result,
        };

        Some(match executed {
            Ok(output) => {
                let row_count = output.rows.len();
                sink.emit(AgentEvent::QueryResult {
                    description: args.description.clone(),
                    sql: args.sql.clone(),
                    columns: output.columns.clone(),
                    rows: output.rows.clone(),
                    row_count,
                    truncated: output.truncated,
                    is_error: false,
                    error: None,
                })
                .await;
                self.persist(
                    handle,
                    Role::Assistant,
                    MessageKind::QueryResult,
                    &args.description,
                    Some(json!({
                        "query": args.sql,
                        "columns": output.columns,
                        "rows": output.rows,
                        "row_count": row_count,
                        "truncated": output.truncated,
                    })),
                )
                .await;
                let content = json!({
                    "columns": output.columns,
                    "rows": output.rows,
                    "row_count": row_count,
                    "truncated": output.truncated,
                    "is_error": false,
                })
                .to_string();
                (ToolResult::ok(&call.id, content), DispatchEffect::None)
            }
            Err(e) => {
                // Not fatal: the error goes back into the loop so the LLM
                // can adjust the query and retry.
                let message = e.to_string();
                warn!(sql = %args.sql, error = %message, "sql_query failed");
                sink.emit(AgentEvent::QueryResult {
                    description: args.description.clone(),
                    sql: args.sql.clone(),
                    columns: Vec::new(),
                    rows: Vec::new(),
                    row_count: 0,
                    truncated: false,
                    is_error: true,
                    error: Some(message.clone()),
                })
                .await;
                self.persist(
                    handle,
                    Role::Assistant,
                    MessageKind::QueryResult,
                    &args.description,
                    Some(json!({
                        "query": args.sql,
                        "columns": [],
                        "rows": [],
                        "row_count": 0,
                        "error": message,
                    })),
                )
                .await;
                (
                    ToolResult::error(
                        &call.id,
                        json!({"is_error": true, "error": message}).to_string(),
                    ),
                    DispatchEffect::None,
                )
            }
        })
    }

    async fn run_output_text(
        &self,
        call: &ToolCall,
        args: OutputTextArgs,
        handle: &SessionHandle,
        sink: &EventSink,
    ) -> (ToolResult, DispatchEffect) {
        sink.emit(AgentEvent::Text {
            text: args.text.clone(),
        })
        .await;
        self.persist(handle, Role::Assistant, MessageKind::Text, &args.text, None)
            .await;
        (ToolResult::ok(&call.id, r#"{"ok":true}"#), DispatchEffect::None)
    }

    async fn run_output_table(
        &self,
        call: &ToolCall,
        args: OutputTableArgs,
        handle: &SessionHandle,
        sink: &EventSink,
    ) -> (ToolResult, DispatchEffect) {
        sink.emit(AgentEvent::Table {
            title: args.title.clone(),
            headers: args.headers.clone(),
            rows: args.rows.clone(),
        })
        .await;
        self.persist(
            handle,
            Role::Assistant,
            MessageKind::Table,
            &args.title,
            Some(json!({"headers": args.headers, "rows": args.rows})),
        )
        .await;
        (ToolResult::ok(&call.id, r#"{"ok":true}"#), DispatchEffect::None)
    }

    async fn run_create_plot(
        &self,
        call: &ToolCall,
        args: CreatePlotArgs,
        handle: &SessionHandle,
        sink: &EventSink,
    ) -> (ToolResult, DispatchEffect) {
        let mut spec = args.spec;
        tools::truncate_plot_data(&mut spec, self.limits.max_plot_rows);

        sink.emit(AgentEvent::Plot {
            title: args.title.clone(),
            spec: spec.clone(),
        })
        .await;
        self.persist(
            handle,
            Role::Assistant,
            MessageKind::Plot,
            &args.title,
            Some(json!({"title": args.title, "spec": spec})),
        )
        .await;
        (ToolResult::ok(&call.id, r#"{"ok":true}"#), DispatchEffect::None)
    }

    async fn run_finalize(
        &self,
        call: &ToolCall,
        args: FinalizeArgs,
        handle: &SessionHandle,
        sink: &EventSink,
    ) -> (ToolResult, DispatchEffect) {
        if let Some(title) = args.session_title.as_deref().filter(|t| !t.trim().is_empty()) {
            let current = {
                let store = handle.store.read().await;
                store
                    .meta(&handle.session_id)
                    .ok()
                    .flatten()
                    .and_then(|meta| meta.title)
            };
            if current.is_none() {
                let updated = {
                    let store = handle.store.write().await;
                    store.set_title(&handle.session_id, title).unwrap_or(false)
                };
                if updated {
                    sink.emit(AgentEvent::SessionUpdate {
                        title: title.to_string(),
                    })
                    .await;
                }
            }
        }
        (
            ToolResult::ok(&call.id, r#"{"ok":true}"#),
            DispatchEffect::Finalized {
                suggestions: args.suggestions,
            },
        )
    }

    async fn persist(
        &self,
        handle: &SessionHandle,
        role: Role,
        kind: MessageKind,
        body: &str,
        payload: Option<Value>,
    ) {
        let store = handle.store.write().await;
        if let Err(e) = store.append(&handle.session_id, role, kind, body, payload) {
            warn!(session = %handle.session_id, error = %e, "failed to persist message");
        }
    }
}
