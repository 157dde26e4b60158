//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use utoipa::OpenApi;

use switchboard_core::config::StorageBackend;

use crate::routes::v1::chat::SESSION_POLICY;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Liveness plus storage backend status.
///
/// `session_policy` documents how the orchestrator reconciles the client's
/// transcript with stored history.  For the redis backend the response also
/// reports `external_store_reachable` from a live `PING`.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let storage = match state.config.storage.backend {
        StorageBackend::Memory => "memory",
        StorageBackend::Redis => "redis",
    };

    let mut body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": storage,
        "session_policy": SESSION_POLICY,
    });

    if state.config.storage.backend == StorageBackend::Redis {
        body["external_store_reachable"] = json!(state.store.ping().await.is_ok());
    }

    Json(body)
}
