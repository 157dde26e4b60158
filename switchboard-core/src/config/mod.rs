//! Resolved application configuration.
//!
//! The configuration is loaded exactly once at startup (see [`loader`]),
//! validated with [`AppConfig::validate`], and then shared read-only behind
//! an `Arc` for the lifetime of the process.  Nothing here mutates after
//! startup.

mod loader;

pub use loader::load_config;

use serde::Deserialize;
use thiserror::Error;

use crate::context::DEFAULT_SUMMARIZATION_PROMPT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse YAML configuration: {0}")]
    YamlParse(String),

    #[error("environment variable '{0}' referenced in configuration is not set")]
    MissingEnvVar(String),

    /// One entry per violation so operators can fix everything in one pass.
    #[error("configuration validation failed:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Complete application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub context: ContextDefaults,
    pub providers: Vec<Provider>,
    pub model_mappings: Vec<ModelMapping>,
}

/// System-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// TCP port to bind (default: `8000`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// `tracing` filter string, e.g. `"info"` or `"debug,hyper=warn"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    #[serde(default)]
    pub log_json: bool,

    /// Session time-to-live in seconds, measured from the last update.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,

    /// Comma-separated allowed CORS origins; unset means wildcard (dev only).
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Serve Swagger UI at `/swagger-ui`; disable in production.
    #[serde(default = "default_true")]
    pub enable_swagger: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            log_json: false,
            session_ttl: default_session_ttl(),
            cors_allowed_origins: None,
            enable_swagger: true,
        }
    }
}

/// Which session-store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default = "default_storage_backend")]
    pub backend: StorageBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: None,
        }
    }
}

/// Global defaults applied to models without an explicit [`ContextConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct ContextDefaults {
    #[serde(default = "default_max_turns")]
    pub default_max_turns: usize,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: usize,
    #[serde(default = "default_reduction_mode")]
    pub default_reduction_mode: ReductionMode,
    #[serde(default)]
    pub default_summarization_model: Option<String>,
    /// Prompt template for the summarization strategy; `{max_tokens}` is
    /// substituted with the model's token budget.
    #[serde(default = "default_summarization_prompt")]
    pub summarization_prompt: String,
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            default_max_turns: default_max_turns(),
            default_max_tokens: default_max_tokens(),
            default_reduction_mode: default_reduction_mode(),
            default_summarization_model: None,
            summarization_prompt: default_summarization_prompt(),
        }
    }
}

/// Context-management budget and strategy for a single model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextConfig {
    pub max_turns: usize,
    pub max_tokens: usize,
    #[serde(default = "default_reduction_mode")]
    pub reduction_mode: ReductionMode,
    #[serde(default)]
    pub summarization_model: Option<String>,
    #[serde(default = "default_true")]
    pub preserve_system_message: bool,
    #[serde(default = "default_true")]
    pub memory_zone_enabled: bool,
}

/// How conversation history is reduced once a budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionMode {
    Truncation,
    SlidingWindow,
    Summarization,
}

impl ReductionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReductionMode::Truncation => "truncation",
            ReductionMode::SlidingWindow => "sliding_window",
            ReductionMode::Summarization => "summarization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Azure,
    Custom,
}

/// A single upstream provider endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    /// Bearer credential; never logged.
    pub api_key: String,
    #[serde(default = "default_provider_type")]
    pub provider_type: ProviderType,
    /// Model allow-list; empty means any model name is accepted.
    #[serde(default)]
    pub models: Vec<String>,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Maps a public display name onto a provider and its real model name.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMapping {
    pub display_name: String,
    pub provider_name: String,
    pub actual_model_name: String,
    #[serde(default)]
    pub context_config: Option<ContextConfig>,
}

impl AppConfig {
    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn mapping(&self, display_name: &str) -> Option<&ModelMapping> {
        self.model_mappings
            .iter()
            .find(|m| m.display_name == display_name)
    }

    /// Effective context config for a model: the mapping override when
    /// present, else the global defaults.  A summarization config without an
    /// explicit model inherits the global default summarization model.
    pub fn effective_context(&self, mapping: Option<&ModelMapping>) -> ContextConfig {
        let mut config = mapping
            .and_then(|m| m.context_config.clone())
            .unwrap_or_else(|| ContextConfig {
                max_turns: self.context.default_max_turns,
                max_tokens: self.context.default_max_tokens,
                reduction_mode: self.context.default_reduction_mode,
                summarization_model: self.context.default_summarization_model.clone(),
                preserve_system_message: true,
                memory_zone_enabled: true,
            });

        if config.reduction_mode == ReductionMode::Summarization
            && config.summarization_model.is_none()
        {
            config.summarization_model = self.context.default_summarization_model.clone();
        }

        config
    }

    /// Whether `name` resolves to a known model: an explicit mapping, or a
    /// `provider/model` namespace with a known provider prefix.
    pub fn model_resolvable(&self, name: &str) -> bool {
        if self.mapping(name).is_some() {
            return true;
        }
        match name.split_once('/') {
            Some((prefix, _)) => self.provider(prefix).is_some(),
            None => false,
        }
    }

    /// Run every cross-reference check and report all violations at once.
    /// Any violation prevents the process from serving traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.providers.is_empty() {
            errors.push("  - at least one provider must be configured".to_owned());
        }
        if self.model_mappings.is_empty() {
            errors.push("  - at least one model mapping must be configured".to_owned());
        }

        for (index, provider) in self.providers.iter().enumerate() {
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
            {
                errors.push(format!(
                    "  - provider '{}' base_url must start with http:// or https://",
                    provider.name
                ));
            }
            if provider.api_key.trim().is_empty() {
                errors.push(format!(
                    "  - provider '{}' api_key must not be empty",
                    provider.name
                ));
            }
            if self.providers[..index].iter().any(|p| p.name == provider.name) {
                errors.push(format!("  - duplicate provider name '{}'", provider.name));
            }
        }

        for (index, mapping) in self.model_mappings.iter().enumerate() {
            if self.model_mappings[..index]
                .iter()
                .any(|m| m.display_name == mapping.display_name)
            {
                errors.push(format!(
                    "  - duplicate model display name '{}'",
                    mapping.display_name
                ));
            }
            match self.provider(&mapping.provider_name) {
                None => errors.push(format!(
                    "  - model mapping '{}' references non-existent provider '{}'",
                    mapping.display_name, mapping.provider_name
                )),
                Some(provider) => {
                    if !provider.models.is_empty()
                        && !provider.models.contains(&mapping.actual_model_name)
                    {
                        errors.push(format!(
                            "  - model mapping '{}' references model '{}' which is not in \
                             provider '{}' allow-list",
                            mapping.display_name, mapping.actual_model_name, provider.name
                        ));
                    }
                }
            }
        }

        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            errors.push("  - storage type is 'redis' but redis_url is not configured".to_owned());
        }

        self.validate_summarization(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn validate_summarization(&self, errors: &mut Vec<String>) {
        if self.context.default_reduction_mode == ReductionMode::Summarization {
            match &self.context.default_summarization_model {
                None => errors.push(
                    "  - global context uses summarization mode but \
                     default_summarization_model is not configured"
                        .to_owned(),
                ),
                Some(model) if !self.model_resolvable(model) => errors.push(format!(
                    "  - default_summarization_model '{model}' does not resolve to a known model"
                )),
                Some(_) => {}
            }
        }

        for mapping in &self.model_mappings {
            let Some(context) = &mapping.context_config else {
                continue;
            };
            if context.reduction_mode != ReductionMode::Summarization {
                continue;
            }
            let model = context
                .summarization_model
                .as_ref()
                .or(self.context.default_summarization_model.as_ref());
            match model {
                None => errors.push(format!(
                    "  - model mapping '{}' uses summarization mode but no summarization_model \
                     is configured or inherited",
                    mapping.display_name
                )),
                Some(model) if !self.model_resolvable(model) => errors.push(format!(
                    "  - model mapping '{}' summarization_model '{model}' does not resolve to a \
                     known model",
                    mapping.display_name
                )),
                Some(_) => {}
            }
        }
    }
}

// ── serde defaults ───────────────────────────────────────────────────────────

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_max_turns() -> usize {
    10
}

fn default_max_tokens() -> usize {
    4000
}

fn default_reduction_mode() -> ReductionMode {
    ReductionMode::Truncation
}

fn default_summarization_prompt() -> String {
    DEFAULT_SUMMARIZATION_PROMPT.to_owned()
}

fn default_provider_type() -> ProviderType {
    ProviderType::Openai
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ── Tests ──────────────────────────────────────────────────────────────────────
