//! Configuration loading: YAML file, `${VAR}` environment substitution, and
//! environment overrides.
//!
//! Substitution happens on the raw document before parsing, so any string
//! value (API keys in particular) can reference a secret with `${VAR}`.  An
//! unresolved placeholder fails startup rather than producing an empty
//! credential.

use std::env;
use std::fs;
use std::path::Path;

use super::{AppConfig, ConfigError};

/// Load, substitute, override, and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;

    let substituted = substitute_env_vars(&raw)?;
    let mut config: AppConfig =
        serde_yaml::from_str(&substituted).map_err(|e| ConfigError::YamlParse(e.to_string()))?;

    apply_env_overrides(&mut config);
    normalize(&mut config);
    config.validate()?;
    Ok(config)
}

/// Replace every `${VAR}` occurrence with the value of the environment
/// variable `VAR`.  A `$` not followed by `{` passes through untouched.
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder; keep the text as written.
            output.push_str(&rest[start..]);
            return Ok(output);
        };
        let name = &after[..end];
        let value =
            env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_owned()))?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

/// A handful of operational settings may be overridden without editing the
/// file: `SWB_PORT`, `SWB_LOG_LEVEL`, and `REDIS_URL`.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Some(port) = env::var("SWB_PORT").ok().and_then(|v| v.parse().ok()) {
        config.system.port = port;
    }
    if let Ok(level) = env::var("SWB_LOG_LEVEL") {
        if !level.trim().is_empty() {
            config.system.log_level = level;
        }
    }
    if let Ok(url) = env::var("REDIS_URL") {
        if !url.trim().is_empty() {
            config.storage.redis_url = Some(url);
        }
    }
}

fn normalize(config: &mut AppConfig) {
    for provider in &mut config.providers {
        while provider.base_url.ends_with('/') {
            provider.base_url.pop();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ReductionMode, StorageBackend};

    const SAMPLE: &str = r#"
system:
  port: 9100
  log_level: debug
  session_ttl: 600
storage:
  type: memory
context:
  default_max_turns: 8
  default_max_tokens: 2000
  default_reduction_mode: sliding_window
providers:
  - name: openai
    base_url: https://api.openai.com/v1/
    api_key: ${SWB_TEST_OPENAI_KEY}
    timeout: 20
model_mappings:
  - display_name: official/gpt-4
    provider_name: openai
    actual_model_name: gpt-4
"#;

    #[test]
    fn parses_yaml_with_substitution_and_normalization() {
        env::set_var("SWB_TEST_OPENAI_KEY", "sk-test-123");
        let substituted = substitute_env_vars(SAMPLE).unwrap();
        let mut config: AppConfig = serde_yaml::from_str(&substituted).unwrap();
        normalize(&mut config);
        config.validate().unwrap();

        assert_eq!(config.system.port, 9100);
        assert_eq!(config.system.session_ttl, 600);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.context.default_max_turns, 8);
        assert_eq!(
            config.context.default_reduction_mode,
            ReductionMode::SlidingWindow
        );
        assert_eq!(config.providers[0].api_key, "sk-test-123");
        // Trailing slash trimmed so URL joining stays predictable.
        assert_eq!(config.providers[0].base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn missing_env_var_fails() {
        let err = substitute_env_vars("key: ${SWB_TEST_DEFINITELY_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "SWB_TEST_DEFINITELY_UNSET_VAR"));
    }

    #[test]
    fn substitution_handles_multiple_and_adjacent_placeholders() {
        env::set_var("SWB_TEST_A", "alpha");
        env::set_var("SWB_TEST_B", "beta");
        let out = substitute_env_vars("x: ${SWB_TEST_A}${SWB_TEST_B} tail").unwrap();
        assert_eq!(out, "x: alphabeta tail");
    }

    #[test]
    fn plain_dollar_signs_pass_through() {
        let out = substitute_env_vars("cost: $5 and $x").unwrap();
        assert_eq!(out, "cost: $5 and $x");
    }
}
