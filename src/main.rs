use anyhow::{Context, Result};
use object_gateway::{
    app,
    config::{AppConfig, Backend},
    services::{disk_store::DiskStore, memory_store::MemoryStore, store::ObjectStore},
    state::AppState,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    // --- Initialize object store ---
    let mut disk_store = None;
    let store: Arc<dyn ObjectStore> = match cfg.backend {
        Backend::Disk => {
            let disk = DiskStore::connect(&cfg.database_url, &cfg.storage_dir)
                .await
                .with_context(|| format!("opening disk store at {}", cfg.database_url))?;
            tracing::info!(
                "Disk store ready (payloads in {}, metadata in {})",
                cfg.storage_dir,
                cfg.database_url
            );
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            disk_store = Some(disk.clone());
            Arc::new(disk)
        }
        Backend::Memory => {
            if migrate {
                tracing::info!("Memory backend has no schema; nothing to migrate.");
                return Ok(());
            }
            tracing::warn!("Using in-memory store; objects are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let local_addr = listener.local_addr()?;

    // --- Build router ---
    let state = AppState::new(store)
        .with_public_origin(cfg.public_origin.clone())
        .with_bind_addr(local_addr.to_string())
        .with_list_limit(cfg.list_limit);
    let router = app(state);

    tracing::info!("Server listening on http://{}", local_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(disk) = disk_store {
        // Commits detached from dropped requests still need to land.
        disk.close().await;
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. In-flight requests are allowed to finish.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
