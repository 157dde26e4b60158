//! switchboard-server – entry point.
//!
//! Startup order:
//! 1. Load and validate configuration (any violation aborts startup).
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Construct the session store and verify it is reachable.
//! 4. Build the provider router and context engine.
//! 5. Start the session TTL sweeper in a background task.
//! 6. Build the axum router and start the HTTP server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use switchboard_core::config::{load_config, StorageBackend};
use switchboard_core::store::memory::MemoryStore;
use switchboard_core::store::redis::RedisStore;
use switchboard_core::{ContextEngine, ProviderRouter, SessionStore, UserHashPolicy};

use switchboard_server::routes;
use switchboard_server::state::{AppState, SessionLocks};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let config_path =
        std::env::var("SWB_CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_owned());
    let config = Arc::new(
        load_config(Path::new(&config_path))
            .with_context(|| format!("failed to load configuration from {config_path}"))?,
    );

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.system.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);

    if config.system.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = config.providers.len(),
        models = config.model_mappings.len(),
        "switchboard starting"
    );

    // ── 3. Session store ───────────────────────────────────────────────────────
    let session_ttl = Duration::from_secs(config.system.session_ttl);
    let store: Arc<dyn SessionStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Redis => {
            let url = config
                .storage
                .redis_url
                .as_deref()
                .context("storage.redis_url must be set for the redis backend")?;
            Arc::new(
                RedisStore::connect(url, session_ttl)
                    .await
                    .context("failed to connect to redis")?,
            )
        }
    };
    info!(backend = ?config.storage.backend, "session store ready");

    // ── 4. Router and context engine ───────────────────────────────────────────
    let router = Arc::new(ProviderRouter::new(config.clone())?);
    let context = ContextEngine::new(config.context.summarization_prompt.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        context,
        router,
        key_policy: Arc::new(UserHashPolicy::default()),
        locks: SessionLocks::default(),
    });

    // ── 5. TTL sweeper ─────────────────────────────────────────────────────────
    let sweeper_locks = state.locks.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            match store.sweep_expired(session_ttl).await {
                Ok(evicted) => {
                    for session_key in evicted {
                        info!(
                            event = "session_expired",
                            session_key = %session_key,
                            "session evicted by ttl sweep"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "session ttl sweep failed"),
            }
            sweeper_locks.purge_idle().await;
        }
    });

    // ── 6. HTTP server ─────────────────────────────────────────────────────────
    let app = routes::build(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.system.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
