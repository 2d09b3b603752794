//! WebSocket transport: one channel per client per session.
//!
//! Inbound `{type, …}` messages drive the session runtime; outbound
//! `{event, data}` envelopes stream the active turn. An invalid credential
//! closes the socket with a policy-violation code before any event is sent.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tabula_agent::event::AgentEvent;
use tabula_agent::runtime::TurnTrigger;
use tabula_session::{MessageKind, Role, SessionMeta};

use crate::auth::decode_token;
use crate::runtime::{SessionRuntime, StartTurnError, EVENT_BUFFER};
use crate::state::AppState;

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Credential from the `token` query param, or the Authorization header.
    let token = params.get("token").cloned().or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, token))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    token: Option<String>,
) {
    // Authenticate and authorize before anything is sent.
    let user_id = token
        .as_deref()
        .and_then(|t| decode_token(t, &state.config.auth.secret_key));
    let Some(user_id) = user_id else {
        close_policy_violation(&mut socket, "invalid or expired token").await;
        return;
    };

    let meta = {
        let store = state.store.read().await;
        store.meta(&session_id).ok().flatten()
    };
    let Some(meta) = meta.filter(|m| m.user_id == user_id) else {
        close_policy_violation(&mut socket, "session not found").await;
        return;
    };

    info!(session = %session_id, user = %user_id, "websocket connected");

    let runtime = state.runtime(&session_id).await;
    let (out_tx, mut out_rx) = mpsc::channel::<String>(EVENT_BUFFER);
    runtime.attach_client(out_tx.clone()).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: serialized event lines → socket.
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if ws_tx.send(Message::Text(line.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: client messages → runtime.
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(raw) => {
                handle_client_message(&state, &runtime, &meta, raw.as_str(), &out_tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(session = %session_id, "websocket disconnected");
    writer.abort();
}

async fn handle_client_message(
    state: &Arc<AppState>,
    runtime: &Arc<SessionRuntime>,
    meta: &SessionMeta,
    raw: &str,
    out_tx: &mpsc::Sender<String>,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        send_error(out_tx, "invalid JSON message").await;
        return;
    };

    match parsed.get("type").and_then(Value::as_str) {
        Some("message") => {
            let Some(text) = parsed.get("text").and_then(Value::as_str) else {
                send_error(out_tx, "message is missing 'text'").await;
                return;
            };
            start_turn(
                state,
                runtime,
                meta,
                TurnTrigger::UserMessage(text.to_string()),
                out_tx,
            )
            .await;
        }
        Some("auto_analyze") => {
            start_turn(state, runtime, meta, TurnTrigger::AutoAnalyze, out_tx).await;
        }
        Some("stop") => {
            runtime.stop().await;
        }
        Some(other) => {
            send_error(out_tx, &format!("unknown message type: {other}")).await;
        }
        None => {
            send_error(out_tx, "message is missing 'type'").await;
        }
    }
}

async fn start_turn(
    state: &Arc<AppState>,
    runtime: &Arc<SessionRuntime>,
    meta: &SessionMeta,
    trigger: TurnTrigger,
    out_tx: &mpsc::Sender<String>,
) {
    let Some(provider) = state.provider.clone() else {
        send_error(out_tx, "assistant is not configured on this server").await;
        return;
    };

    // Refuse to queue behind an active turn before touching the log.
    if runtime.has_active_turn().await {
        send_error(out_tx, "a turn is already in progress; wait for done or send stop").await;
        return;
    }

    // Persist the user message first: the loop reads it back via log replay.
    if let TurnTrigger::UserMessage(text) = &trigger {
        let store = state.store.write().await;
        if let Err(e) = store.append(&meta.id, Role::User, MessageKind::Text, text.clone(), None) {
            warn!(session = %meta.id, error = %e, "failed to persist user message");
            send_error(out_tx, "failed to record your message").await;
            return;
        }
    }

    let agent = state.agent_loop(provider);
    let handle = state.handle_for(meta);
    match runtime.start_turn(agent, handle, trigger).await {
        Ok(()) => {}
        Err(StartTurnError::TurnActive) => {
            send_error(out_tx, "a turn is already in progress; wait for done or send stop").await;
        }
    }
}

async fn send_error(out_tx: &mpsc::Sender<String>, message: &str) {
    let line = serde_json::to_string(&AgentEvent::error(message)).unwrap_or_default();
    let _ = out_tx.send(line).await;
}

async fn close_policy_violation(socket: &mut WebSocket, reason: &str) {
    warn!(reason, "closing websocket");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_string().into(),
        })))
        .await;
}
