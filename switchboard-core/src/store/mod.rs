//! Session persistence.
//!
//! [`SessionStore`] is the capability set every backend must provide.  The
//! backend is chosen once at startup ([`memory::MemoryStore`] or
//! [`redis::RedisStore`]) and shared as `Arc<dyn SessionStore>`; handlers
//! never learn which one they are talking to.
//!
//! Trait methods return boxed futures so the trait stays object-safe.
//! Callers serialize writes to one session through the orchestrator's keyed
//! locks; backends only guarantee that individual operations are atomic and
//! that reads observe a point-in-time snapshot.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::session::key::SessionKey;
use crate::session::{Message, Session};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or over deadline; the request may be retried
    /// later, so the server answers 503 with a `Retry-After` hint.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// The stored record could not be decoded.
    #[error("session record is corrupt: {0}")]
    Corrupt(String),
}

pub trait SessionStore: Send + Sync {
    /// Point-in-time snapshot of the session, or `None` if absent.
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<Session>>;

    /// Upsert the session, refreshing `updated_at` (and the backend TTL
    /// where the backend has one).
    fn put<'a>(&'a self, session: Session) -> StoreFuture<'a, ()>;

    /// Append one message, creating the session if absent.
    fn append_message<'a>(&'a self, key: &'a SessionKey, message: Message) -> StoreFuture<'a, ()>;

    /// Clear the history; the memory zone and metadata survive.
    fn reset<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()>;

    /// Evict sessions idle for longer than `ttl` and return their storage
    /// keys.  Backends with native expiry return an empty list.
    fn sweep_expired<'a>(&'a self, ttl: Duration) -> StoreFuture<'a, Vec<String>>;

    /// Cheap reachability probe for health reporting.
    fn ping<'a>(&'a self) -> StoreFuture<'a, ()>;
}
