//! Redis-backed session storage.
//!
//! Each session is serialized as one JSON value under its canonical
//! `session:{user_id}:{session_id}` key with a native TTL (`SET … EX`),
//! refreshed on every write, so redis itself handles expiry and
//! [`SessionStore::sweep_expired`] has nothing to do.
//!
//! `ConnectionManager` reconnects transparently; every failure is mapped to
//! [`StoreError::Unavailable`] so the orchestrator can answer 503 with a
//! `Retry-After` hint.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{SessionStore, StoreError, StoreFuture};
use crate::session::key::SessionKey;
use crate::session::{Message, Session};

pub struct RedisStore {
    connection: ConnectionManager,
    session_ttl: Duration,
}

impl RedisStore {
    /// Connect and verify the server answers `PING` before serving traffic.
    pub async fn connect(redis_url: &str, session_ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let store = Self {
            connection,
            session_ttl,
        };
        store.probe().await?;
        Ok(store)
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|err| StoreError::Unavailable(format!("failed to reach redis: {err}")))?;
        Ok(())
    }

    fn ttl_seconds(&self) -> u64 {
        self.session_ttl.as_secs().max(1)
    }

    async fn load(&self, storage_key: &str) -> Result<Option<Session>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection
            .get(storage_key)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt(err.to_string()))
        })
        .transpose()
    }

    async fn save(&self, mut session: Session) -> Result<(), StoreError> {
        session.touch();
        let storage_key = session.storage_key();
        let raw = serde_json::to_string(&session)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(storage_key, raw, self.ttl_seconds())
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

impl SessionStore for RedisStore {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move { self.load(&key.storage_key()).await })
    }

    fn put<'a>(&'a self, session: Session) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.save(session).await })
    }

    fn append_message<'a>(&'a self, key: &'a SessionKey, mut message: Message) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut session = self
                .load(&key.storage_key())
                .await?
                .unwrap_or_else(|| Session::new(key));
            message.timestamp.get_or_insert_with(chrono::Utc::now);
            session.history.push(message);
            self.save(session).await
        })
    }

    fn reset<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let Some(mut session) = self.load(&key.storage_key()).await? else {
                return Ok(());
            };
            session.reset();
            self.save(session).await
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let _: i64 = connection
                .del(key.storage_key())
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            Ok(())
        })
    }

    fn sweep_expired<'a>(&'a self, _ttl: Duration) -> StoreFuture<'a, Vec<String>> {
        // Redis expires keys natively.
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn ping<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.probe().await })
    }
}
