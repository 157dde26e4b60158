//! Provider routing and upstream dispatch.
//!
//! [`ProviderRouter`] resolves a public display name to a provider and its
//! real model name, then forwards the request to
//! `{base_url}/chat/completions` with the provider's bearer credential.
//! One pooled `reqwest::Client` is kept per provider.
//!
//! Streaming dispatch reads the upstream body as a line-oriented SSE stream
//! and posts typed [`StreamEvent`]s on a bounded channel.  Each chunk keeps
//! the raw JSON payload alongside the parsed form so the orchestrator can
//! re-emit upstream frames byte-for-byte.  Dropping the receiver cancels
//! the upstream read.
//!
//! There is no retry and no failover here: a duplicate submission to an LLM
//! is worse than a surfaced error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{AppConfig, ContextConfig, Provider};
use crate::context::{SummaryClient, SummaryFuture};
use crate::openai::{ChatCompletionChunk, ChatCompletionResponse, ModelInfo, RequestParams};
use crate::session::{Message, Role};

const STREAM_CHANNEL_CAPACITY: usize = 32;
const DIAGNOSTIC_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("model '{0}' not found in configuration")]
    ModelNotFound(String),

    /// Upstream answered with an error status.
    #[error("provider '{provider}' returned status {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    /// Upstream answered 2xx but the body was not what it promised.
    #[error("provider '{provider}' returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("request to provider '{provider}' timed out")]
    Timeout { provider: String },

    #[error("failed to reach provider '{provider}': {message}")]
    Connect { provider: String, message: String },
}

/// Resolution result: where to send the request and under what budget.
pub struct ResolvedModel<'a> {
    pub provider: &'a Provider,
    pub actual_model: String,
    pub context: ContextConfig,
    pub display_name: &'a str,
}

/// One event from an upstream SSE stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// Upstream sent `data: [DONE]` or closed the connection cleanly.
    Done,
    Error(RouterError),
}

/// A parsed chunk plus the exact payload bytes it came from.
#[derive(Debug)]
pub struct StreamChunk {
    pub raw: String,
    pub chunk: ChatCompletionChunk,
}

pub struct ProviderRouter {
    config: Arc<AppConfig>,
    clients: HashMap<String, reqwest::Client>,
}

impl ProviderRouter {
    /// Build one pooled client per configured provider.  The per-request
    /// timeout is applied at dispatch time: buffered calls bound the whole
    /// exchange, streaming calls bound connect and time-to-headers only.
    pub fn new(config: Arc<AppConfig>) -> Result<Self, RouterError> {
        let mut clients = HashMap::new();
        for provider in &config.providers {
            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(provider.timeout))
                .build()
                .map_err(|err| RouterError::Connect {
                    provider: provider.name.clone(),
                    message: err.to_string(),
                })?;
            clients.insert(provider.name.clone(), client);
        }
        Ok(Self { config, clients })
    }

    /// Resolve a display name.
    ///
    /// Mapping-table matches win; otherwise the name is split once on the
    /// FIRST `/` and the prefix is tried as a provider name, so the model
    /// suffix may itself contain `/`.
    pub fn resolve<'a>(&'a self, display_name: &'a str) -> Result<ResolvedModel<'a>, RouterError> {
        if let Some(mapping) = self.config.mapping(display_name) {
            let provider = self
                .config
                .provider(&mapping.provider_name)
                .ok_or_else(|| RouterError::ModelNotFound(display_name.to_owned()))?;
            return Ok(ResolvedModel {
                provider,
                actual_model: mapping.actual_model_name.clone(),
                context: self.config.effective_context(Some(mapping)),
                display_name,
            });
        }

        if let Some((prefix, suffix)) = display_name.split_once('/') {
            if let Some(provider) = self.config.provider(prefix) {
                return Ok(ResolvedModel {
                    provider,
                    actual_model: suffix.to_owned(),
                    context: self.config.effective_context(None),
                    display_name,
                });
            }
        }

        Err(RouterError::ModelNotFound(display_name.to_owned()))
    }

    /// Enumerate every configured mapping in OpenAI `/v1/models` shape.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let created = Utc::now().timestamp();
        self.config
            .model_mappings
            .iter()
            .map(|mapping| ModelInfo {
                id: mapping.display_name.clone(),
                object: "model".to_owned(),
                created,
                owned_by: mapping.provider_name.clone(),
            })
            .collect()
    }

    /// Buffered call to `POST {base_url}/chat/completions`.
    pub async fn dispatch(
        &self,
        provider: &Provider,
        actual_model: &str,
        messages: &[Message],
        params: &RequestParams,
    ) -> Result<ChatCompletionResponse, RouterError> {
        let response = self
            .client(provider)
            .post(format!("{}/chat/completions", provider.base_url))
            .bearer_auth(&provider.api_key)
            .timeout(Duration::from_secs(provider.timeout))
            .json(&request_body(actual_model, messages, params, false))
            .send()
            .await
            .map_err(|err| classify_send_error(&provider.name, &err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|_| RouterError::InvalidResponse {
                provider: provider.name.clone(),
                reason: "response body read failed".to_owned(),
            })?;

        if status.as_u16() >= 400 {
            let message = short_diagnostic(&body);
            warn!(
                event = "provider_error",
                provider = %provider.name,
                status = status.as_u16(),
                diagnostic = %message,
                "upstream returned error status"
            );
            return Err(RouterError::Provider {
                provider: provider.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|_| RouterError::InvalidResponse {
            provider: provider.name.clone(),
            reason: "invalid_response".to_owned(),
        })
    }

    /// Streaming call.  Returns after upstream headers arrive; the body is
    /// consumed by a reader task that feeds the returned channel.  Upstream
    /// error statuses surface as an `Err` here, before any frame flows.
    ///
    /// `provider.timeout` bounds the wait for upstream headers.  The body
    /// read itself is unbounded so long generations are not cut off
    /// mid-stream.
    pub async fn stream_dispatch(
        &self,
        provider: &Provider,
        actual_model: &str,
        messages: &[Message],
        params: &RequestParams,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        let send = self
            .client(provider)
            .post(format!("{}/chat/completions", provider.base_url))
            .bearer_auth(&provider.api_key)
            .json(&request_body(actual_model, messages, params, true))
            .send();
        let response = match tokio::time::timeout(Duration::from_secs(provider.timeout), send).await
        {
            Ok(result) => result.map_err(|err| classify_send_error(&provider.name, &err))?,
            Err(_) => {
                return Err(RouterError::Timeout {
                    provider: provider.name.clone(),
                })
            }
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            let message = short_diagnostic(&body);
            warn!(
                event = "provider_error",
                provider = %provider.name,
                status = status.as_u16(),
                diagnostic = %message,
                "upstream rejected streaming request"
            );
            return Err(RouterError::Provider {
                provider: provider.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let provider_name = provider.name.clone();
        tokio::spawn(read_sse_stream(response, provider_name, tx));
        Ok(rx)
    }

    fn client(&self, provider: &Provider) -> reqwest::Client {
        self.clients
            .get(&provider.name)
            .cloned()
            .unwrap_or_else(reqwest::Client::new)
    }
}

impl SummaryClient for ProviderRouter {
    fn summarize<'a>(&'a self, model: &'a str, prompt: String) -> SummaryFuture<'a> {
        Box::pin(async move {
            let resolved = self.resolve(model)?;
            let messages = vec![Message::new(Role::User, prompt)];
            let response = self
                .dispatch(
                    resolved.provider,
                    &resolved.actual_model,
                    &messages,
                    &RequestParams::default(),
                )
                .await?;
            Ok(response
                .choices
                .first()
                .map(|choice| choice.message.content.clone())
                .unwrap_or_default())
        })
    }
}

/// Rewrite the outbound body: the caller's display name is replaced with the
/// provider's real model name; sampling parameters pass through unchanged.
fn request_body(
    actual_model: &str,
    messages: &[Message],
    params: &RequestParams,
    stream: bool,
) -> Value {
    let mut body = match serde_json::to_value(params) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    body.insert("model".to_owned(), json!(actual_model));
    body.insert(
        "messages".to_owned(),
        Value::Array(messages.iter().map(wire_message).collect()),
    );
    if stream {
        body.insert("stream".to_owned(), json!(true));
    }
    Value::Object(body)
}

/// Project a stored message onto the OpenAI wire shape (no timestamps).
fn wire_message(message: &Message) -> Value {
    let mut object = Map::new();
    object.insert("role".to_owned(), json!(message.role));
    object.insert("content".to_owned(), json!(message.content));
    if let Some(name) = &message.name {
        object.insert("name".to_owned(), json!(name));
    }
    Value::Object(object)
}

fn classify_send_error(provider: &str, err: &reqwest::Error) -> RouterError {
    if err.is_timeout() {
        RouterError::Timeout {
            provider: provider.to_owned(),
        }
    } else {
        RouterError::Connect {
            provider: provider.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Pull a short human diagnostic out of an upstream error body without
/// echoing the whole payload into logs or client responses.
fn short_diagnostic(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return message.chars().take(DIAGNOSTIC_MAX_CHARS).collect();
        }
    }
    let trimmed: String = body.chars().take(DIAGNOSTIC_MAX_CHARS).collect();
    if trimmed.is_empty() {
        "no response body".to_owned()
    } else {
        trimmed
    }
}

/// One logical SSE line.
enum SseLine {
    Payload(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(rest) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest);
    if payload.trim() == "[DONE]" {
        SseLine::Done
    } else if payload.trim().is_empty() {
        SseLine::Ignore
    } else {
        SseLine::Payload(payload.to_owned())
    }
}

/// Reader task: parse SSE lines off the upstream body and post events until
/// `[DONE]`, upstream close, or error.  A closed channel means the consumer
/// went away, which cancels the read (and with it the upstream request).
async fn read_sse_stream(
    response: reqwest::Response,
    provider: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(next) = stream.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::Error(classify_send_error(&provider, &err)))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_owned();
            buffer.drain(..=newline);

            match parse_sse_line(&line) {
                SseLine::Done => {
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }
                SseLine::Payload(raw) => match serde_json::from_str::<ChatCompletionChunk>(&raw) {
                    Ok(chunk) => {
                        if tx
                            .send(StreamEvent::Chunk(StreamChunk { raw, chunk }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = tx
                            .send(StreamEvent::Error(RouterError::InvalidResponse {
                                provider,
                                reason: "invalid_response".to_owned(),
                            }))
                            .await;
                        return;
                    }
                },
                SseLine::Ignore => {}
            }
        }
    }

    // Upstream closed without a [DONE] sentinel; the sequence still ends.
    let _ = tx.send(StreamEvent::Done).await;
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{
        ContextDefaults, ModelMapping, ProviderType, ReductionMode, StorageConfig, SystemConfig,
    };

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            system: SystemConfig::default(),
            storage: StorageConfig::default(),
            context: ContextDefaults::default(),
            providers: vec![Provider {
                name: "openai".to_owned(),
                base_url: "https://api.openai.com/v1".to_owned(),
                api_key: "sk-test".to_owned(),
                provider_type: ProviderType::Openai,
                models: Vec::new(),
                timeout: 30,
                max_retries: 3,
            }],
            model_mappings: vec![ModelMapping {
                display_name: "official/gpt-4".to_owned(),
                provider_name: "openai".to_owned(),
                actual_model_name: "gpt-4-0613".to_owned(),
                context_config: None,
            }],
        })
    }

    fn router() -> ProviderRouter {
        ProviderRouter::new(test_config()).unwrap()
    }

    #[test]
    fn mapping_table_wins_over_namespace_parsing() {
        let router = router();
        // "official/gpt-4" could parse as provider "official", but the
        // explicit mapping takes precedence.
        let resolved = router.resolve("official/gpt-4").unwrap();
        assert_eq!(resolved.provider.name, "openai");
        assert_eq!(resolved.actual_model, "gpt-4-0613");
    }

    #[test]
    fn namespace_splits_on_first_slash_only() {
        let router = router();
        let resolved = router.resolve("openai/org/custom-model").unwrap();
        assert_eq!(resolved.provider.name, "openai");
        assert_eq!(resolved.actual_model, "org/custom-model");
    }

    #[test]
    fn unknown_provider_and_bare_names_fail() {
        let router = router();
        assert!(matches!(
            router.resolve("ghost/x"),
            Err(RouterError::ModelNotFound(name)) if name == "ghost/x"
        ));
        assert!(matches!(
            router.resolve("gpt-4"),
            Err(RouterError::ModelNotFound(_))
        ));
    }

    #[test]
    fn namespace_resolution_uses_global_defaults() {
        let router = router();
        let resolved = router.resolve("openai/gpt-3.5-turbo").unwrap();
        assert_eq!(resolved.context.max_turns, 10);
        assert_eq!(resolved.context.reduction_mode, ReductionMode::Truncation);
    }

    #[test]
    fn list_models_enumerates_mappings() {
        let router = router();
        let models = router.list_models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "official/gpt-4");
        assert_eq!(models[0].object, "model");
        assert_eq!(models[0].owned_by, "openai");
    }

    #[test]
    fn request_body_rewrites_model_and_passes_params() {
        let messages = vec![Message::new(Role::User, "Hi")];
        let params = RequestParams {
            temperature: Some(0.5),
            max_tokens: Some(128),
            ..RequestParams::default()
        };
        let body = request_body("gpt-4-0613", &messages, &params, false);

        assert_eq!(body["model"], "gpt-4-0613");
        assert_eq!(body["temperature"], serde_json::json!(0.5));
        assert_eq!(body["max_tokens"], serde_json::json!(128));
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hi");
        assert!(body.get("stream").is_none());
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn streaming_body_sets_stream_flag() {
        let body = request_body(
            "gpt-4",
            &[Message::new(Role::User, "Hi")],
            &RequestParams::default(),
            true,
        );
        assert_eq!(body["stream"], serde_json::json!(true));
    }

    #[test]
    fn wire_messages_omit_timestamps() {
        let mut message = Message::new(Role::User, "Hi");
        message.timestamp = Some(Utc::now());
        let value = wire_message(&message);
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn sse_line_parsing() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line("data:[DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line(""), SseLine::Ignore));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Ignore));
        assert!(matches!(parse_sse_line("event: ping"), SseLine::Ignore));
        match parse_sse_line(r#"data: {"id":"1"}"#) {
            SseLine::Payload(raw) => assert_eq!(raw, r#"{"id":"1"}"#),
            _ => panic!("expected payload"),
        }
    }

    #[test]
    fn short_diagnostic_prefers_error_message() {
        let body = r#"{"error":{"message":"model is overloaded","type":"server_error"}}"#;
        assert_eq!(short_diagnostic(body), "model is overloaded");
        assert_eq!(short_diagnostic("plain text failure"), "plain text failure");
        assert_eq!(short_diagnostic(""), "no response body");
        let long = "x".repeat(500);
        assert_eq!(short_diagnostic(&long).len(), DIAGNOSTIC_MAX_CHARS);
    }
}
