//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] and renders the OpenAI error envelope
//! `{"error": {"message", "type", "code"}}` with the matching HTTP status.
//!
//! **Security note:** internal detail is logged with `tracing`; the client
//! only ever sees the short, credential-free `Display` message.

use axum::extract::{FromRequest, Request};
use axum::http::header::RETRY_AFTER;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::error;

use switchboard_core::openai::ErrorResponse;
use switchboard_core::{RouterError, StoreError};

/// Seconds a caller should wait before retrying when the store is down.
pub const RETRY_AFTER_SECS: &str = "5";

#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller sent an invalid or malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Propagated from model resolution or upstream dispatch.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Propagated from the session store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Status plus envelope, shared by [`IntoResponse`] and the streaming
    /// path (which emits the envelope as an SSE frame instead).
    pub fn to_parts(&self) -> (StatusCode, ErrorResponse) {
        match self {
            ServerError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(message, "invalid_request_error", "invalid_request"),
            ),
            ServerError::Router(RouterError::ModelNotFound(_)) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(self.to_string(), "invalid_request_error", "model_not_found"),
            ),
            ServerError::Router(
                RouterError::Provider { .. } | RouterError::InvalidResponse { .. },
            ) => (
                StatusCode::BAD_GATEWAY,
                ErrorResponse::new(self.to_string(), "api_error", "provider_error"),
            ),
            ServerError::Router(RouterError::Timeout { .. } | RouterError::Connect { .. }) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::new(self.to_string(), "timeout_error", "timeout"),
            ),
            ServerError::Store(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new(err.to_string(), "api_error", "service_unavailable"),
            ),
            ServerError::Internal(message) => {
                error!(message = %message, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal server error", "api_error", "internal_error"),
                )
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let retryable = matches!(self, ServerError::Store(_));
        let (status, envelope) = self.to_parts();
        let mut response = (status, Json(envelope)).into_response();
        if retryable {
            response
                .headers_mut()
                .insert(RETRY_AFTER, RETRY_AFTER_SECS.parse().unwrap());
        }
        response
    }
}

/// `Json` extractor whose rejection is rendered as the OpenAI error
/// envelope instead of axum's plain-text default.
pub struct OpenAiJson<T>(pub T);

impl<S, T> FromRequest<S> for OpenAiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ServerError::InvalidRequest(rejection.body_text())),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
