//! Catalog HTTP server

use crate::common::{Config, Result, StoreBackend};
use crate::coordinator::album::Album;
use crate::coordinator::catalog::Coordinator;
use crate::coordinator::http::{create_router, AppState};
use crate::ops::seed::{load_catalog_file, seed_catalog};
use crate::store::{MemoryStore, RedisStore, Store};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Server {
    config: Config,
    catalog: Option<Vec<Album>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            catalog: None,
        }
    }

    /// Load these albums before serving, instead of `server.seed_file`
    pub fn with_catalog(mut self, albums: Vec<Album>) -> Self {
        self.catalog = Some(albums);
        self
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting albumkv server {}", crate::BUILD_INFO);
        tracing::info!("  HTTP API: {}", self.config.server.bind_addr);
        tracing::info!("  Backend: {:?}", self.config.store.backend);
        tracing::info!("  Top-K strategy: {:?}", self.config.topk.strategy);
        tracing::info!(
            "  Pool: max {} connections, {} idle",
            self.config.pool.max_size,
            self.config.pool.max_idle
        );

        match self.config.store.backend {
            StoreBackend::Redis => {
                tracing::info!("  Redis: {}", self.config.store.url);
                let store = RedisStore::open(&self.config.store, &self.config.pool)?;
                self.run(store).await
            }
            StoreBackend::Memory => {
                let store = MemoryStore::new(&self.config.pool);
                self.run(store).await
            }
        }
    }

    async fn run<S: Store>(self, store: S) -> Result<()> {
        let coordinator = Coordinator::new(
            Arc::new(store),
            self.config.keyspace.clone(),
            self.config.topk.clone(),
        );

        let catalog = match (self.catalog, &self.config.server.seed_file) {
            (Some(albums), _) => Some(albums),
            (None, Some(path)) => Some(load_catalog_file(path)?),
            (None, None) => None,
        };
        if let Some(albums) = catalog {
            let report = seed_catalog(&coordinator, &albums).await?;
            tracing::info!("  Seeded {} albums", report.inserted);
        }

        let router = create_router(AppState {
            coordinator,
            popular_limit: self.config.server.popular_limit,
        });

        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;
        tracing::info!("✓ Server ready on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
