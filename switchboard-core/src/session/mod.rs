//! Conversation sessions and their message data model.
//!
//! A [`Session`] holds two independently mutable stores: the ordered
//! conversation `history`, which the context engine may replace with a
//! reduced version, and the `memory_zone`, an append-only list of summary
//! texts that survives every reduction and reset.  Only deleting the whole
//! session removes memory-zone entries.

pub mod key;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use self::key::SessionKey;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => f.write_str("system"),
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// A single message in a conversation.  Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Set by the store on append; not part of the OpenAI wire shape.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            timestamp: None,
        }
    }

    /// Token approximation mandated by the service contract: ⌈len/4⌉.
    /// Callers must not depend on exact values.
    pub fn estimated_tokens(&self) -> usize {
        self.content.len().div_ceil(4)
    }
}

/// Number of user+assistant turns in `messages`; system messages are
/// excluded and a dangling unpaired message counts as a turn.
pub fn turn_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .count()
        .div_ceil(2)
}

/// Estimated token total across `messages`.
pub fn estimated_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}

/// Per-conversation state persisted in the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub memory_zone: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_tokens_used: u64,
}

impl Session {
    pub fn new(key: &SessionKey) -> Self {
        let now = Utc::now();
        Self {
            session_id: key.session_id.clone(),
            user_id: key.user_id.clone(),
            history: Vec::new(),
            memory_zone: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            total_tokens_used: 0,
        }
    }

    /// Storage key shared by every backend: `session:{user_id}:{session_id}`.
    pub fn storage_key(&self) -> String {
        format!("session:{}:{}", self.user_id, self.session_id)
    }

    pub fn turn_count(&self) -> usize {
        turn_count(&self.history)
    }

    pub fn estimated_tokens(&self) -> usize {
        estimated_tokens(&self.history)
    }

    /// Clear the conversation history.  The memory zone and metadata are
    /// left intact; only deleting the session removes them.
    pub fn reset(&mut self) {
        self.history.clear();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
