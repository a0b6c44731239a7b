use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sb_bridge::{api_router, ApiState, CommandBus};
use sb_core::config::{Config, StorageBackend};
use sb_core::sqlite::SqliteStore;
use sb_core::store::{MemoryStore, Store};
use sb_harness::provider::ClientSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sweeper::RetentionSweeper;

/// Owns the wired command surface and the background sweeper.
pub struct Daemon {
    config: Config,
    bus: Arc<CommandBus>,
    sweeper: Arc<RetentionSweeper>,
    shutdown: CancellationToken,
}

/// Open the backend named in `config`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory store; nothing will survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let store = SqliteStore::new(&config.storage.path)
                .await
                .with_context(|| format!("failed to open {}", config.storage.path))?;
            info!(path = %config.storage.path, "sqlite store ready");
            Ok(Arc::new(store))
        }
    }
}

impl Daemon {
    pub async fn new(config: Config, clients: ClientSet) -> Result<Self> {
        let store = open_store(&config).await?;
        Ok(Self::with_store(config, store, clients).await)
    }

    pub async fn with_store(config: Config, store: Arc<dyn Store>, clients: ClientSet) -> Self {
        let bus = Arc::new(CommandBus::wire(store, clients).await);
        let sweeper = Arc::new(RetentionSweeper::new(
            bus.recorder().clone(),
            bus.settings().clone(),
        ));
        Self {
            config,
            bus,
            sweeper,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    /// Cancelling the returned token stops the server and the sweeper.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve on a pre-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;

        let sweeper = self.sweeper.clone();
        let interval = Duration::from_secs(self.config.daemon.sweep_interval_secs);
        let sweep_cancel = self.shutdown.child_token();
        let sweep_handle = tokio::spawn(async move { sweeper.run(interval, sweep_cancel).await });

        let state = Arc::new(
            ApiState::new(self.bus.clone()).with_dev_tokens(!self.config.security.require_csrf),
        );
        let router = api_router(state);

        info!(%addr, "command surface listening");
        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("http server failed")?;

        self.shutdown.cancel();
        sweep_handle.await.context("sweeper task panicked")?;
        info!("daemon stopped");
        Ok(())
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        self.run_with_listener(listener).await
    }
}
