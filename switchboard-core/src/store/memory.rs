//! In-process session storage.
//!
//! A `tokio::sync::RwLock<HashMap>` keyed by the canonical storage key.
//! Reads clone the session out under the read lock (point-in-time
//! snapshot); writes take the write lock, so concurrent appends to one
//! session are serialized in lock-acquisition order.  Expiry is driven by a
//! server-side sweep task calling [`SessionStore::sweep_expired`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError, StoreFuture};
use crate::session::key::SessionKey;
use crate::session::{Message, Session};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl SessionStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            Ok(self
                .sessions
                .read()
                .await
                .get(&key.storage_key())
                .cloned())
        })
    }

    fn put<'a>(&'a self, mut session: Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            session.touch();
            self.sessions
                .write()
                .await
                .insert(session.storage_key(), session);
            Ok(())
        })
    }

    fn append_message<'a>(&'a self, key: &'a SessionKey, mut message: Message) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(key.storage_key())
                .or_insert_with(|| Session::new(key));
            message.timestamp.get_or_insert_with(Utc::now);
            session.history.push(message);
            session.touch();
            Ok(())
        })
    }

    fn reset<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if let Some(session) = self.sessions.write().await.get_mut(&key.storage_key()) {
                session.reset();
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.sessions.write().await.remove(&key.storage_key());
            Ok(())
        })
    }

    fn sweep_expired<'a>(&'a self, ttl: Duration) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(ttl)
                    .map_err(|e| StoreError::Corrupt(format!("invalid ttl: {e}")))?;
            let mut sessions = self.sessions.write().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.updated_at < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                sessions.remove(key);
            }
            Ok(expired)
        })
    }

    fn ping<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::session::Role;

    fn key(user: &str) -> SessionKey {
        SessionKey {
            user_id: user.to_owned(),
            session_id: "session_1".to_owned(),
        }
    }

    #[tokio::test]
    async fn append_creates_session_and_preserves_order() {
        let store = MemoryStore::new();
        let key = key("alice");

        store
            .append_message(&key, Message::new(Role::User, "first"))
            .await
            .unwrap();
        store
            .append_message(&key, Message::new(Role::Assistant, "second"))
            .await
            .unwrap();

        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.session_id, "session_1");
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].content, "first");
        assert_eq!(session.history[1].content, "second");
        assert!(session.history.iter().all(|m| m.timestamp.is_some()));
    }

    #[tokio::test]
    async fn get_returns_snapshot_not_live_view() {
        let store = MemoryStore::new();
        let key = key("alice");
        store
            .append_message(&key, Message::new(Role::User, "hi"))
            .await
            .unwrap();

        let snapshot = store.get(&key).await.unwrap().unwrap();
        store
            .append_message(&key, Message::new(Role::Assistant, "hello"))
            .await
            .unwrap();

        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(store.get(&key).await.unwrap().unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn reset_clears_history_only() {
        let store = MemoryStore::new();
        let key = key("alice");
        let mut session = Session::new(&key);
        session.history.push(Message::new(Role::User, "hi"));
        session.memory_zone.push("summary".to_owned());
        store.put(session).await.unwrap();

        store.reset(&key).await.unwrap();

        let session = store.get(&key).await.unwrap().unwrap();
        assert!(session.history.is_empty());
        assert_eq!(session.memory_zone, vec!["summary".to_owned()]);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let store = MemoryStore::new();
        let key = key("alice");
        store
            .append_message(&key, Message::new(Role::User, "hi"))
            .await
            .unwrap();

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_sessions() {
        let store = MemoryStore::new();
        let stale_key = key("stale");
        let fresh_key = key("fresh");

        let mut stale = Session::new(&stale_key);
        stale.updated_at = Utc::now() - chrono::Duration::seconds(120);
        store
            .sessions
            .write()
            .await
            .insert(stale.storage_key(), stale);
        store
            .append_message(&fresh_key, Message::new(Role::User, "hi"))
            .await
            .unwrap();

        let evicted = store.sweep_expired(Duration::from_secs(60)).await.unwrap();
        assert_eq!(evicted, vec!["session:stale:session_1".to_owned()]);
        assert!(store.get(&stale_key).await.unwrap().is_none());
        assert!(store.get(&fresh_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let store = Arc::new(MemoryStore::new());
        let key = key("alice");

        let mut handles = Vec::new();
        for index in 0..32 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message(&key, Message::new(Role::User, format!("m{index}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.history.len(), 32);
    }
}
