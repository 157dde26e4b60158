//! Shared application state injected into every axum handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use switchboard_core::{
    AppConfig, ContextEngine, ProviderRouter, SessionKeyPolicy, SessionStore, StoreError,
};

/// Deadline for any single session-store operation.  Exceeding it maps to
/// 503 / service unavailable rather than hanging the request.
pub const STORE_OP_DEADLINE: Duration = Duration::from_secs(5);

/// State shared across all HTTP handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    /// Immutable resolved configuration.
    pub config: Arc<AppConfig>,
    /// Session persistence backend, chosen at startup.
    pub store: Arc<dyn SessionStore>,
    pub context: ContextEngine,
    pub router: Arc<ProviderRouter>,
    pub key_policy: Arc<dyn SessionKeyPolicy>,
    pub locks: SessionLocks,
}

/// Per-session single-flight: concurrent requests for one session key are
/// serialized so interleaved appends cannot corrupt history order.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    /// Take the lock for `key`, waiting behind any in-flight request for the
    /// same session.  The guard is owned so it can ride into spawned tasks
    /// (the streaming path holds it until the post-stream session write).
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop lock entries nobody is holding; called from the TTL sweep task
    /// so the map does not grow with every session key ever seen.
    pub async fn purge_idle(&self) {
        self.inner
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Apply [`STORE_OP_DEADLINE`] to a store operation.
pub async fn with_store_deadline<T>(
    operation: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(STORE_OP_DEADLINE, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(
            "session store operation exceeded deadline".to_owned(),
        )),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn locks_serialize_same_key() {
        let locks = SessionLocks::default();
        let guard = locks.acquire("session:a:1").await;

        // A second acquisition for the same key must wait for the guard.
        let pending = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("session:a:1").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = SessionLocks::default();
        let _guard = locks.acquire("session:a:1").await;
        // Must not deadlock.
        let _other = locks.acquire("session:b:1").await;
    }

    #[tokio::test]
    async fn purge_drops_only_idle_entries() {
        let locks = SessionLocks::default();
        let held = locks.acquire("session:held:1").await;
        drop(locks.acquire("session:idle:1").await);

        locks.purge_idle().await;

        let map = locks.inner.lock().await;
        assert!(map.contains_key("session:held:1"));
        assert!(!map.contains_key("session:idle:1"));
        drop(held);
    }
}
