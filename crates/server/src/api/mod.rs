pub mod doc;
pub mod sessions;

use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use sessions::{sessions_delete, sessions_get, sessions_list};

/// Error body shared by every REST endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Liveness check
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Server is up"))
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
