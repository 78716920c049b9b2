//! tm-server: HTTP API in front of the job engine.
//!
//! This crate wires the store, storage, tool registry and [`Engine`] into
//! a running server. It provides:
//!
//! - Multipart submission, status pull and per-job SSE push
//! - An admin event firehose and the tool catalog
//! - Request IDs, HTTP rate limiting and graceful shutdown

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tm_core::config::Config;
use tm_db::SqliteJobStore;
use tm_engine::{Engine, EngineConfig, LocalStorage, ToolRegistry};
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Build the engine described by `config` without starting it.
pub fn build_engine(config: &Config, registry: ToolRegistry) -> tm_core::Result<Engine> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }
    let store = SqliteJobStore::open(&db_path.to_string_lossy())?;
    tracing::info!("Database opened at {}", db_path.display());

    std::fs::create_dir_all(&config.storage.root)?;
    let storage = LocalStorage::new(&config.storage.root);

    Ok(Engine::new(
        EngineConfig::from(config),
        Arc::new(store),
        Arc::new(storage),
        registry,
    ))
}

/// Start the toolmatrix server.
///
/// Opens the database, recovers persisted jobs, starts the worker pool and
/// serves HTTP until a shutdown signal arrives. In-flight jobs are allowed
/// to finish before returning.
pub async fn start(config: Config) -> tm_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let registry = ToolRegistry::from_config(&config.tools);
    if registry.is_empty() {
        tracing::warn!("No tool handlers configured; every job will fail");
    }
    for tool in registry.tools() {
        tracing::info!(tool = %tool, "Tool handler registered");
    }

    let engine = Arc::new(build_engine(&config, registry)?);
    engine.start().await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| tm_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(Arc::clone(&engine), config);
    let app = router::build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| tm_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine.cancellation()))
        .await;

    engine.shutdown().await;
    served.map_err(|e| tm_core::Error::Internal(format!("Server error: {e}")))?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or the engine's cancellation token.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
