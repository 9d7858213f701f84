//! Server configuration and startup.
//!
//! ```text
//! TcpListener ── axum Router ── DocumentHost ── DocumentActor (per key)
//!                    │               │
//!               RateLimiter    AlarmScheduler ── Storage (RocksDB | memory)
//! ```
//!
//! Without a storage path every document lives in process memory and is
//! lost on restart.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::actor::DocumentLimits;
use crate::clock::{Clock, SystemClock};
use crate::host::{DocumentHost, HostConfig};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::router::{self, AppState};
use crate::storage::{MemoryStore, RocksStore, Storage, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Origin used in document URLs returned by `POST /api/docs`
    pub public_origin: Option<String>,
    /// Per-document limits
    pub limits: DocumentLimits,
    /// Idle time before an actor is evicted (None = never)
    pub idle_eviction: Option<Duration>,
    /// Document creation limit per client
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let host = HostConfig::default();
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            storage_path: None,
            public_origin: None,
            limits: host.limits,
            idle_eviction: host.idle_eviction,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Ephemeral document server.
pub struct SyncServer {
    config: ServerConfig,
    host: DocumentHost,
    limiter: Arc<RateLimiter>,
}

impl SyncServer {
    /// Open storage and start the document host. Must be called from within
    /// a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`SyncServer::new`] with an injected wall clock.
    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let storage: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured, documents are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_storage(config, storage, clock))
    }

    /// Build a server over an existing store.
    pub fn with_storage(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let host = DocumentHost::new(
            storage,
            clock.clone(),
            HostConfig {
                limits: config.limits,
                idle_eviction: config.idle_eviction,
            },
        );
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, clock));
        Self {
            config,
            host,
            limiter,
        }
    }

    /// Re-arm expiry alarms persisted by a previous process.
    pub fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        let recovered = self.host.recover()?;
        log::info!("Recovery complete: {recovered} expiry alarms re-armed");
        Ok(recovered)
    }

    /// The HTTP surface of this server.
    pub fn router(&self) -> Router {
        router::router(AppState {
            host: self.host.clone(),
            limiter: self.limiter.clone(),
            public_origin: self.config.public_origin.clone(),
        })
    }

    /// Serve requests from an already bound listener in a background task.
    pub fn spawn(&self, listener: TcpListener) -> JoinHandle<std::io::Result<()>> {
        let app = self.router();
        tokio::spawn(async move { axum::serve(listener, app).await })
    }

    /// Bind, recover and serve until Ctrl-C, then flush every resident document.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.recover()?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr: SocketAddr = listener.local_addr()?;
        log::info!("Sync server listening on {addr}");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for shutdown signal: {e}");
                    std::future::pending::<()>().await;
                }
                log::info!("Shutdown requested");
            })
            .await?;

        self.host.shutdown().await;
        Ok(())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn host(&self) -> &DocumentHost {
        &self.host
    }
}
