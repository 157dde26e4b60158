//! OpenAI-compatible chat-completion route: the hot path.
//!
//! Per request: resolve the model, derive the session key, load (or create)
//! the session under its per-session lock, adopt the client's transcript,
//! reduce context if a budget is exceeded, dispatch upstream, and append
//! the assistant turn after the response completes.
//!
//! Streaming responses are SSE pass-through: every upstream `data:` payload
//! is re-emitted byte-for-byte while `content` and reasoning channels are
//! accumulated concurrently; the session write happens after the final
//! `[DONE]` frame.  If the caller disconnects mid-stream, the upstream read
//! is cancelled and the partial turn is discarded.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use utoipa::OpenApi;
use uuid::Uuid;

use switchboard_core::openai::{ChatCompletionRequest, ChatCompletionResponse, Delta};
use switchboard_core::session::estimated_tokens;
use switchboard_core::{Message, Role, SessionKey, SessionStore, StreamEvent};

use crate::error::{OpenAiJson, ServerError};
use crate::middleware::trace;
use crate::state::{with_store_deadline, AppState};

/// Reported by `GET /health`: the session's user/system history is replaced
/// by each request's transcript, and the assistant turn is appended by the
/// server after completion.  Clients are expected to re-send prior turns.
pub const SESSION_POLICY: &str = "client_transcript_replace";

const STREAM_BUFFER: usize = 32;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(ChatCompletionRequest, ChatCompletionResponse))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// When `stream: true`, the upstream SSE stream is passed through frame by
/// frame and terminated with `data: [DONE]`.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request or unknown model"),
        (status = 502, description = "Upstream provider error"),
        (status = 503, description = "Session store unavailable"),
        (status = 504, description = "Upstream timeout"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    OpenAiJson(request): OpenAiJson<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    validate(&request)?;
    let request_id = trace::request_id(&headers);

    // Resolve before touching the store: an unknown model must not create
    // or mutate any session.
    let (provider, actual_model, context_config) = {
        let resolved = state.router.resolve(&request.model)?;
        (
            resolved.provider.clone(),
            resolved.actual_model,
            resolved.context,
        )
    };

    let key = state.key_policy.derive(request.user.as_deref());
    info!(
        event = "api_call",
        request_id = %request_id,
        session_key = %key,
        model = %request.model,
        message_count = request.messages.len(),
        stream = request.stream,
        "chat completion request"
    );

    let guard = state.locks.acquire(&key.storage_key()).await;

    let mut session = with_store_deadline(state.store.get(&key))
        .await?
        .unwrap_or_else(|| switchboard_core::Session::new(&key));

    // Clients re-send the full transcript each turn; adopt it wholesale.
    session.history = request.messages.clone();
    for message in &mut session.history {
        message.timestamp.get_or_insert_with(Utc::now);
    }

    if state.context.should_reduce(&session.history, &context_config) {
        let before_tokens = estimated_tokens(&session.history);
        let before_messages = session.history.len();
        let reduction = state
            .context
            .apply_strategy(&session.history, &context_config, state.router.as_ref())
            .await;
        if context_config.memory_zone_enabled {
            if let Some(summary) = &reduction.summary {
                session.memory_zone.push(summary.clone());
            }
        }
        session.history = reduction.messages;
        info!(
            event = "context_reduction",
            request_id = %request_id,
            session_key = %key,
            strategy = reduction.applied.as_str(),
            before_tokens,
            after_tokens = estimated_tokens(&session.history),
            before_messages,
            after_messages = session.history.len(),
            "context reduced"
        );
    }

    with_store_deadline(state.store.put(session.clone())).await?;

    let params = request.params();

    if request.stream {
        let upstream = state
            .router
            .stream_dispatch(&provider, &actual_model, &session.history, &params)
            .await?;

        let (frames_tx, frames_rx) = mpsc::channel::<Result<Event, Infallible>>(STREAM_BUFFER);
        tokio::spawn(forward_stream(
            upstream,
            frames_tx,
            state.store.clone(),
            key,
            guard,
            request_id,
            request.model.clone(),
        ));
        return Ok(Sse::new(ReceiverStream::new(frames_rx)).into_response());
    }

    let mut response = state
        .router
        .dispatch(&provider, &actual_model, &session.history, &params)
        .await?;

    // Clients asked for the display name; hand it back consistently.
    response.model = request.model.clone();

    if let Some(choice) = response.choices.first() {
        let mut assistant = choice.message.clone();
        assistant.timestamp = Some(Utc::now());
        session.history.push(assistant);
        if let Some(usage) = &response.usage {
            session.total_tokens_used += usage.total_tokens;
        }
        // The upstream call already succeeded; a failed write must not turn
        // a good completion into a client-visible error.
        if let Err(err) = with_store_deadline(state.store.put(session)).await {
            warn!(
                error = %err,
                session_key = %key,
                "failed to persist session after completion"
            );
        }
    }

    match &response.usage {
        Some(usage) => info!(
            event = "api_completion",
            request_id = %request_id,
            session_key = %key,
            model = %response.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "completion returned"
        ),
        None => info!(
            event = "api_completion",
            request_id = %request_id,
            session_key = %key,
            model = %response.model,
            completion_tokens_estimated = response
                .choices
                .first()
                .map(|choice| choice.message.estimated_tokens())
                .unwrap_or(0),
            "completion returned"
        ),
    }

    drop(guard);
    Ok(Json(response).into_response())
}

/// Forward upstream events to the caller while accumulating the assistant
/// turn, then persist it.  Holds the session lock for the stream's
/// lifetime.  A failed downstream send means the caller disconnected:
/// dropping the upstream receiver cancels the provider read and the partial
/// turn is discarded.
async fn forward_stream(
    mut upstream: mpsc::Receiver<StreamEvent>,
    downstream: mpsc::Sender<Result<Event, Infallible>>,
    store: Arc<dyn SessionStore>,
    key: SessionKey,
    _guard: OwnedMutexGuard<()>,
    request_id: Uuid,
    model: String,
) {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut completed = false;

    while let Some(event) = upstream.recv().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                for choice in &chunk.chunk.choices {
                    accumulate(&choice.delta, &mut content, &mut reasoning);
                }
                if downstream
                    .send(Ok(Event::default().data(chunk.raw)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            StreamEvent::Error(err) => {
                warn!(
                    request_id = %request_id,
                    session_key = %key,
                    error = %err,
                    "upstream stream failed mid-response"
                );
                let (_, envelope) = ServerError::Router(err).to_parts();
                let frame = serde_json::to_string(&envelope).unwrap_or_else(|_| {
                    r#"{"error":{"message":"stream failed","type":"api_error"}}"#.to_owned()
                });
                let _ = downstream.send(Ok(Event::default().data(frame))).await;
                break;
            }
            StreamEvent::Done => {
                completed = true;
                break;
            }
        }
    }

    if downstream
        .send(Ok(Event::default().data("[DONE]")))
        .await
        .is_err()
    {
        return;
    }

    if !completed {
        // Errored streams do not append a partial assistant turn.
        return;
    }

    if !reasoning.is_empty() {
        info!(
            event = "reasoning_detected",
            request_id = %request_id,
            session_key = %key,
            model = %model,
            reasoning_length = reasoning.len(),
            "reasoning channel observed"
        );
    }

    let final_content = if content.is_empty() {
        reasoning.clone()
    } else {
        content.clone()
    };
    if !final_content.is_empty() {
        let message = Message::new(Role::Assistant, final_content);
        if let Err(err) = with_store_deadline(store.append_message(&key, message)).await {
            warn!(
                error = %err,
                session_key = %key,
                "failed to persist assistant message after stream"
            );
        }
    }

    // Streaming usage is approximated from character counts and tagged as
    // such; callers must not treat these as tokenizer-accurate.
    info!(
        event = "api_completion",
        request_id = %request_id,
        session_key = %key,
        model = %model,
        completion_tokens_estimated = content.len().div_ceil(4),
        reasoning_tokens_estimated = reasoning.len().div_ceil(4),
        "stream completed"
    );
}

/// Fold one delta into the running accumulators.  `reasoning_content` and
/// `thinking` are alternate spellings of the same channel.
fn accumulate(delta: &Delta, content: &mut String, reasoning: &mut String) {
    if let Some(part) = &delta.content {
        content.push_str(part);
    }
    if let Some(part) = &delta.reasoning_content {
        reasoning.push_str(part);
    }
    if let Some(part) = &delta.thinking {
        reasoning.push_str(part);
    }
}

fn validate(request: &ChatCompletionRequest) -> Result<(), ServerError> {
    if request.messages.is_empty() {
        return Err(ServerError::InvalidRequest(
            "messages must not be empty".to_owned(),
        ));
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ServerError::InvalidRequest(format!(
                "invalid temperature ({temperature}): must be between 0.0 and 2.0"
            )));
        }
    }
    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ServerError::InvalidRequest(format!(
                "invalid top_p ({top_p}): must be between 0.0 and 1.0"
            )));
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens == 0 {
            return Err(ServerError::InvalidRequest(
                "max_tokens must be at least 1".to_owned(),
            ));
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
