//! Axum router assembly: REST surface, WebSocket upgrade, CORS, API docs.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::state::AppState;
use crate::{api, ws};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/sessions", get(api::sessions_list))
        .route(
            "/sessions/{id}",
            get(api::sessions_get).delete(api::sessions_delete),
        )
        .route("/sessions/{id}/ws", get(ws::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(Scalar::with_url("/docs", api::doc::ApiDoc::openapi()))
}
