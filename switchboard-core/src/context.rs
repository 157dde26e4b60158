//! Context reduction.
//!
//! The orchestrator asks [`ContextEngine::should_reduce`] before every
//! dispatch; when a budget is exceeded, [`ContextEngine::apply_strategy`]
//! rewrites the history according to the model's configured
//! [`ReductionMode`].
//!
//! Invariants common to every strategy:
//! - system messages are preserved and placed at the head in their original
//!   relative order (unless `preserve_system_message` is off)
//! - the retained non-system messages are a contiguous suffix of the input
//! - summarization failures never fail the request; the engine falls back
//!   to truncation and logs a warning

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::config::{ContextConfig, ReductionMode};
use crate::router::RouterError;
use crate::session::{estimated_tokens, turn_count, Message, Role};

/// Marks a synthetic summary message so later reductions treat it as a
/// pinned system message instead of summarizing it again.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]:";

pub const DEFAULT_SUMMARIZATION_PROMPT: &str = "You are a conversation summarizer. Summarize \
    the following conversation concisely, preserving key information, user intent, and \
    important context. Keep the summary under {max_tokens} tokens.";

pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, RouterError>> + Send + 'a>>;

/// Anything that can produce a summary via an LLM call.  Implemented by
/// [`crate::router::ProviderRouter`]; tests substitute a canned client.
pub trait SummaryClient: Send + Sync {
    fn summarize<'a>(&'a self, model: &'a str, prompt: String) -> SummaryFuture<'a>;
}

/// Outcome of one reduction pass.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub messages: Vec<Message>,
    pub summary: Option<String>,
    /// The strategy that actually ran; differs from the configured mode when
    /// summarization fell back to truncation.
    pub applied: ReductionMode,
}

#[derive(Clone)]
pub struct ContextEngine {
    summarization_prompt: String,
}

impl ContextEngine {
    pub fn new(summarization_prompt: impl Into<String>) -> Self {
        Self {
            summarization_prompt: summarization_prompt.into(),
        }
    }

    /// True iff the history exceeds the turn budget or the token budget.
    pub fn should_reduce(&self, messages: &[Message], config: &ContextConfig) -> bool {
        turn_count(messages) > config.max_turns
            || estimated_tokens(messages) > config.max_tokens
    }

    /// Reduce `messages` with the configured strategy.  Never fails: a
    /// failed or empty summarization degrades to truncation.
    pub async fn apply_strategy(
        &self,
        messages: &[Message],
        config: &ContextConfig,
        summarizer: &dyn SummaryClient,
    ) -> Reduction {
        match config.reduction_mode {
            ReductionMode::Truncation => Reduction {
                messages: truncate(messages, config),
                summary: None,
                applied: ReductionMode::Truncation,
            },
            ReductionMode::SlidingWindow => Reduction {
                messages: sliding_window(messages, config),
                summary: None,
                applied: ReductionMode::SlidingWindow,
            },
            ReductionMode::Summarization => match self
                .summarize(messages, config, summarizer)
                .await
            {
                Ok(reduction) => reduction,
                Err(reason) => {
                    warn!(
                        reason = %reason,
                        "summarization failed, falling back to truncation"
                    );
                    Reduction {
                        messages: truncate(messages, config),
                        summary: None,
                        applied: ReductionMode::Truncation,
                    }
                }
            },
        }
    }

    async fn summarize(
        &self,
        messages: &[Message],
        config: &ContextConfig,
        summarizer: &dyn SummaryClient,
    ) -> Result<Reduction, String> {
        let model = config
            .summarization_model
            .as_deref()
            .ok_or_else(|| "summarization_model is not configured".to_owned())?;

        let (system, other) = split_priority(messages, config);
        let keep = keep_tail_len(config, other.len());
        let split_at = other.len() - keep;
        let (old, kept) = other.split_at(split_at);
        if old.is_empty() {
            // Nothing left to summarize once the tail is kept.
            let mut result = system;
            result.extend_from_slice(kept);
            return Ok(Reduction {
                messages: result,
                summary: None,
                applied: ReductionMode::Summarization,
            });
        }

        let prompt = self.build_prompt(old, config.max_tokens);
        let summary = summarizer
            .summarize(model, prompt)
            .await
            .map_err(|err| err.to_string())?;
        let summary = summary.trim().to_owned();
        if summary.is_empty() {
            return Err("summarizer returned an empty result".to_owned());
        }

        let mut result = system;
        result.push(Message::new(
            Role::System,
            format!("{SUMMARY_PREFIX} {summary}"),
        ));
        result.extend_from_slice(kept);
        Ok(Reduction {
            messages: result,
            summary: Some(summary),
            applied: ReductionMode::Summarization,
        })
    }

    fn build_prompt(&self, old: &[Message], max_tokens: usize) -> String {
        let transcript: Vec<String> = old
            .iter()
            .map(|message| format!("{}: {}", message.role, message.content))
            .collect();
        format!(
            "{}\n\n{}\n\nSummary:",
            self.summarization_prompt
                .replace("{max_tokens}", &max_tokens.to_string()),
            transcript.join("\n")
        )
    }
}

/// Partition into (pinned system messages, everything else), both in their
/// original relative order.
fn split_priority(messages: &[Message], config: &ContextConfig) -> (Vec<Message>, Vec<Message>) {
    if !config.preserve_system_message {
        return (Vec::new(), messages.to_vec());
    }
    let mut system = Vec::new();
    let mut other = Vec::new();
    for message in messages {
        if message.role == Role::System {
            system.push(message.clone());
        } else {
            other.push(message.clone());
        }
    }
    (system, other)
}

/// Non-system messages retained for `max_turns` turns (two messages each).
fn turn_budget_messages(config: &ContextConfig) -> usize {
    config.max_turns.saturating_mul(2)
}

fn keep_tail_len(config: &ContextConfig, available: usize) -> usize {
    // Keep at least two recent messages so the model always sees the latest
    // exchange even under tiny budgets.
    turn_budget_messages(config).max(2).min(available)
}

/// Keep the newest messages up to the turn budget; oldest are dropped first.
fn truncate(messages: &[Message], config: &ContextConfig) -> Vec<Message> {
    let (mut result, other) = split_priority(messages, config);
    let keep = turn_budget_messages(config).min(other.len());
    result.extend_from_slice(&other[other.len() - keep..]);
    result
}

/// Walk newest-to-oldest accumulating estimated tokens, keeping each message
/// while the running total stays within `max_tokens`.
fn sliding_window(messages: &[Message], config: &ContextConfig) -> Vec<Message> {
    let (mut result, other) = split_priority(messages, config);
    let mut kept = Vec::new();
    let mut total = 0usize;
    for message in other.iter().rev() {
        let tokens = message.estimated_tokens();
        if total + tokens > config.max_tokens {
            break;
        }
        total += tokens;
        kept.push(message.clone());
    }
    kept.reverse();
    result.extend(kept);
    result
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    struct FixedSummary(&'static str);

    impl SummaryClient for FixedSummary {
        fn summarize<'a>(&'a self, _model: &'a str, _prompt: String) -> SummaryFuture<'a> {
            Box::pin(async move { Ok(self.0.to_owned()) })
        }
    }

    struct FailingSummary;

    impl SummaryClient for FailingSummary {
        fn summarize<'a>(&'a self, _model: &'a str, _prompt: String) -> SummaryFuture<'a> {
            Box::pin(async move {
                Err(RouterError::Provider {
                    provider: "openai".to_owned(),
                    status: 500,
                    message: "boom".to_owned(),
                })
            })
        }
    }

    fn config(mode: ReductionMode, max_turns: usize, max_tokens: usize) -> ContextConfig {
        ContextConfig {
            max_turns,
            max_tokens,
            reduction_mode: mode,
            summarization_model: Some("official/gpt-3.5".to_owned()),
            preserve_system_message: true,
            memory_zone_enabled: true,
        }
    }

    fn turns(count: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        for index in 0..count {
            messages.push(Message::new(Role::User, format!("question {index}")));
            messages.push(Message::new(Role::Assistant, format!("answer {index}")));
        }
        messages
    }

    fn engine() -> ContextEngine {
        ContextEngine::new(DEFAULT_SUMMARIZATION_PROMPT)
    }

    #[test]
    fn should_reduce_on_turn_overflow_only_above_limit() {
        let engine = engine();
        let cfg = config(ReductionMode::Truncation, 10, 1_000_000);
        assert!(!engine.should_reduce(&turns(10), &cfg));
        assert!(engine.should_reduce(&turns(11), &cfg));
    }

    #[test]
    fn should_reduce_on_token_overflow() {
        let engine = engine();
        let cfg = config(ReductionMode::Truncation, 1_000, 10);
        let history = vec![Message::new(Role::User, "x".repeat(41))];
        assert!(engine.should_reduce(&history, &cfg));
        let history = vec![Message::new(Role::User, "x".repeat(40))];
        assert!(!engine.should_reduce(&history, &cfg));
    }

    #[test]
    fn system_messages_do_not_count_toward_turns() {
        let engine = engine();
        let cfg = config(ReductionMode::Truncation, 10, 1_000_000);
        let mut history = vec![Message::new(Role::System, "be brief")];
        history.extend(turns(10));
        assert!(!engine.should_reduce(&history, &cfg));
    }

    #[tokio::test]
    async fn truncation_keeps_contiguous_suffix_with_system_head() {
        let engine = engine();
        let cfg = config(ReductionMode::Truncation, 10, 1_000_000);

        let mut history = vec![Message::new(Role::System, "be brief")];
        history.extend(turns(11));
        history.push(Message::new(Role::User, "newest question"));

        let reduction = engine
            .apply_strategy(&history, &cfg, &FailingSummary)
            .await;
        assert_eq!(reduction.applied, ReductionMode::Truncation);
        assert!(reduction.summary.is_none());

        let result = &reduction.messages;
        assert_eq!(result[0].role, Role::System);
        // 20 non-system messages = at most 10 turns.
        assert_eq!(result.len(), 21);
        assert_eq!(result.last().unwrap().content, "newest question");

        // Contiguous suffix of the input, oldest dropped first.
        let non_system: Vec<_> = result[1..].iter().map(|m| m.content.clone()).collect();
        let expected: Vec<_> = history[history.len() - 20..]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(non_system, expected);
    }

    #[tokio::test]
    async fn sliding_window_respects_token_budget() {
        let engine = engine();
        // Each message below is 40 chars = 10 estimated tokens.
        let cfg = config(ReductionMode::SlidingWindow, 1_000, 25);
        let history = vec![
            Message::new(Role::System, "s".repeat(40)),
            Message::new(Role::User, "a".repeat(40)),
            Message::new(Role::Assistant, "b".repeat(40)),
            Message::new(Role::User, "c".repeat(40)),
        ];

        let reduction = engine
            .apply_strategy(&history, &cfg, &FailingSummary)
            .await;
        let contents: Vec<_> = reduction
            .messages
            .iter()
            .map(|m| m.content.chars().next().unwrap())
            .collect();
        // System pinned at head; only the two newest fit the 25-token budget.
        assert_eq!(contents, vec!['s', 'b', 'c']);
    }

    #[tokio::test]
    async fn summarization_injects_summary_message_and_reduces_tokens() {
        let engine = engine();
        let cfg = config(ReductionMode::Summarization, 2, 1_000_000);
        let mut history = vec![Message::new(Role::System, "be brief")];
        history.extend(turns(6));

        let reduction = engine
            .apply_strategy(&history, &cfg, &FixedSummary("they discussed six things"))
            .await;

        assert_eq!(reduction.applied, ReductionMode::Summarization);
        assert_eq!(
            reduction.summary.as_deref(),
            Some("they discussed six things")
        );

        let result = &reduction.messages;
        assert_eq!(result[0].content, "be brief");
        assert!(result[1].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(result[1].role, Role::System);
        // Four kept messages (two turns) follow the summary.
        assert_eq!(result.len(), 6);
        assert_eq!(result.last().unwrap().content, "answer 5");
        assert!(estimated_tokens(result) < estimated_tokens(&history));
    }

    #[tokio::test]
    async fn summary_message_is_pinned_in_later_reductions() {
        let engine = engine();
        let cfg = config(ReductionMode::Truncation, 1, 1_000_000);
        let mut history = vec![Message::new(
            Role::System,
            format!("{SUMMARY_PREFIX} old summary"),
        )];
        history.extend(turns(3));

        let reduction = engine
            .apply_strategy(&history, &cfg, &FailingSummary)
            .await;
        assert!(reduction.messages[0].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(reduction.messages.len(), 3);
    }

    #[tokio::test]
    async fn summarization_failure_falls_back_to_truncation() {
        let engine = engine();
        let cfg = config(ReductionMode::Summarization, 2, 1_000_000);
        let history = turns(6);

        let reduction = engine.apply_strategy(&history, &cfg, &FailingSummary).await;

        assert_eq!(reduction.applied, ReductionMode::Truncation);
        assert!(reduction.summary.is_none());
        let expected = truncate(&history, &cfg);
        assert_eq!(reduction.messages, expected);
    }

    #[tokio::test]
    async fn empty_summary_falls_back_to_truncation() {
        let engine = engine();
        let cfg = config(ReductionMode::Summarization, 2, 1_000_000);
        let history = turns(6);

        let reduction = engine
            .apply_strategy(&history, &cfg, &FixedSummary("   "))
            .await;
        assert_eq!(reduction.applied, ReductionMode::Truncation);
        assert!(reduction.summary.is_none());
    }

    #[tokio::test]
    async fn unpinned_system_messages_age_out_when_preservation_is_off() {
        let engine = engine();
        let mut cfg = config(ReductionMode::Truncation, 1, 1_000_000);
        cfg.preserve_system_message = false;

        let mut history = vec![Message::new(Role::System, "be brief")];
        history.extend(turns(3));

        let reduction = engine.apply_strategy(&history, &cfg, &FailingSummary).await;
        assert_eq!(reduction.messages.len(), 2);
        assert!(reduction.messages.iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn prompt_substitutes_token_budget_and_appends_transcript() {
        let engine = engine();
        let old = vec![
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
        ];
        let prompt = engine.build_prompt(&old, 4000);
        assert!(prompt.contains("under 4000 tokens"));
        assert!(prompt.contains("user: hi\nassistant: hello"));
        assert!(prompt.ends_with("Summary:"));
    }
}
