//! switchboard-core – domain library for the switchboard mediation service.
//!
//! switchboard sits between OpenAI-SDK chat clients and a fleet of upstream
//! LLM providers.  This crate holds everything that is independent of the
//! HTTP server:
//!
//! - [`config`]   – the resolved, validated configuration snapshot
//! - [`session`]  – conversation sessions, messages, and key derivation
//! - [`store`]    – pluggable session persistence (in-memory or redis)
//! - [`context`]  – turn/token budgets and the three reduction strategies
//! - [`router`]   – display-name resolution and upstream dispatch (buffered
//!   and SSE-streaming)
//! - [`openai`]   – OpenAI-compatible wire types

pub mod config;
pub mod context;
pub mod openai;
pub mod router;
pub mod session;
pub mod store;

pub use config::{AppConfig, ConfigError, ContextConfig, ModelMapping, Provider, ReductionMode};
pub use context::{ContextEngine, Reduction, SummaryClient};
pub use router::{ProviderRouter, RouterError, StreamChunk, StreamEvent};
pub use session::key::{SessionKey, SessionKeyPolicy, UserHashPolicy};
pub use session::{Message, Role, Session};
pub use store::{SessionStore, StoreError};
