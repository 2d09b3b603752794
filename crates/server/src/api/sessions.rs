//! Session REST surface: list, restore, delete. Upload belongs to the file
//! collaborator; chat belongs to the WebSocket.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use tabula_session::{SessionMeta, StoredMessage};

use crate::auth::CurrentUser;
use crate::state::AppState;

use super::ErrorResponse;

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummaryDto {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FileInfoDto {
    pub filename: String,
    pub row_count: u64,
    pub column_count: usize,
    pub columns: Vec<String>,
    /// First rows of the dataset, cached at upload.
    #[schema(value_type = Vec<Object>)]
    pub preview: Vec<Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageDto {
    pub id: u64,
    #[schema(value_type = String)]
    pub role: tabula_session::Role,
    #[schema(value_type = String)]
    pub kind: tabula_session::MessageKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionDetailDto {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub file: FileInfoDto,
    pub messages: Vec<MessageDto>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("session not found: {id}"),
        }),
    )
}

fn internal(message: String) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: message }))
}

/// Load a session owned by the caller; non-owners get the same 404 as a
/// missing session.
async fn owned_session(state: &AppState, id: &str, user_id: &str) -> Result<SessionMeta, ApiError> {
    let store = state.store.read().await;
    match store.meta(id) {
        Ok(Some(meta)) if meta.user_id == user_id => Ok(meta),
        Ok(_) => Err(not_found(id)),
        Err(e) => Err(internal(format!("failed to read session: {e}"))),
    }
}

/// List the caller's sessions
///
/// Most recent first.
#[utoipa::path(
    get,
    path = "/sessions",
    tag = "Sessions",
    responses(
        (status = 200, description = "Session summaries", body = [SessionSummaryDto]),
        (status = 401, description = "Invalid credential", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn sessions_list(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<SessionSummaryDto>>, ApiError> {
    let store = state.store.read().await;
    let summaries = store
        .list_for_user(&user_id)
        .map_err(|e| internal(format!("failed to list sessions: {e}")))?;
    Ok(Json(
        summaries
            .into_iter()
            .map(|s| SessionSummaryDto {
                id: s.id,
                title: s.title,
                created_at: s.created_at,
            })
            .collect(),
    ))
}

/// Restore a session
///
/// Returns metadata, file info with preview, and the visible message log.
/// Internal reasoning and raw query results are excluded.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "Sessions",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session detail", body = SessionDetailDto),
        (status = 404, description = "Not found or not owned", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn sessions_get(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<SessionDetailDto>, ApiError> {
    let meta = owned_session(&state, &id, &user_id).await?;

    let messages = {
        let store = state.store.read().await;
        store
            .messages(&id)
            .map_err(|e| internal(format!("failed to read messages: {e}")))?
    };

    let profile = &meta.file.profile;
    let detail = SessionDetailDto {
        id: meta.id.clone(),
        title: meta.title.clone(),
        created_at: meta.created_at,
        file: FileInfoDto {
            filename: meta.file.filename.clone(),
            row_count: profile.row_count,
            column_count: profile.column_count,
            columns: profile.column_names(),
            preview: profile.preview.clone(),
        },
        messages: messages.iter().filter(|m| m.kind.restorable()).map(to_dto).collect(),
    };
    Ok(Json(detail))
}

fn to_dto(message: &StoredMessage) -> MessageDto {
    MessageDto {
        id: message.id,
        role: message.role,
        kind: message.kind,
        text: message.body.clone(),
        payload: message.payload.clone(),
        created_at: message.created_at,
    }
}

/// Delete a session
///
/// Cascades to the uploaded file and all messages. A second delete returns
/// 404.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    tag = "Sessions",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or not owned", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn sessions_delete(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    owned_session(&state, &id, &user_id).await?;

    // Cancel any running turn before the directory disappears under it.
    state.drop_runtime(&id).await;

    let deleted = {
        let store = state.store.write().await;
        store
            .delete(&id)
            .map_err(|e| internal(format!("failed to delete session: {e}")))?
    };
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}
