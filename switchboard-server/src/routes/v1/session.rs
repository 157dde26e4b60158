//! Session administration routes.
//!
//! Sessions are addressed by the user identity they were derived from, so
//! callers never need to know the derived key.  Reset clears the history
//! while the memory zone survives; delete removes everything including the
//! memory zone.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::json;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::{with_store_deadline, AppState};

#[derive(OpenApi)]
#[openapi(paths(reset_session, delete_session))]
pub struct SessionApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/{user}/reset", post(reset_session))
        .route("/sessions/{user}", delete(delete_session))
}

/// Clear a user's conversation history (`POST /v1/sessions/{user}/reset`).
/// Memory-zone summaries and metadata are preserved.
#[utoipa::path(
    post,
    path = "/v1/sessions/{user}/reset",
    tag = "sessions",
    responses(
        (status = 200, description = "History cleared", body = serde_json::Value),
        (status = 503, description = "Session store unavailable"),
    )
)]
pub async fn reset_session(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let key = state.key_policy.derive(Some(&user));
    let _guard = state.locks.acquire(&key.storage_key()).await;
    with_store_deadline(state.store.reset(&key)).await?;
    Ok(Json(json!({ "reset": true, "session_key": key.storage_key() })))
}

/// Destroy a user's session entirely (`DELETE /v1/sessions/{user}`),
/// including the memory zone.
#[utoipa::path(
    delete,
    path = "/v1/sessions/{user}",
    tag = "sessions",
    responses(
        (status = 200, description = "Session deleted", body = serde_json::Value),
        (status = 503, description = "Session store unavailable"),
    )
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let key = state.key_policy.derive(Some(&user));
    let _guard = state.locks.acquire(&key.storage_key()).await;
    with_store_deadline(state.store.delete(&key)).await?;
    Ok(Json(json!({ "deleted": true })))
}
