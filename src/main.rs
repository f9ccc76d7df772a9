//! msgrelay - store-and-forward message relay
//!
//! Clients register a public key, look each other up and queue opaque messages
//! that their targets pull later. One request per TCP connection.

use msgrelay_server::{
    run_metrics_server, Config, ConnectionLimits, Metrics, Server, ServerConfig,
};
use msgrelay_storage::{RelayStore, Storage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MSGRELAY_CONFIG is set, then env overrides)
    let config_path = std::env::var("MSGRELAY_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid configuration ({}), using defaults", e);
            Config::default()
        }
    };

    let bind_addr = config.network.resolve_bind_addr();

    tracing::info!("Starting msgrelay server");
    tracing::info!("  Bind address: {}", bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Timeouts: read {}s, write {}s",
        config.network.read_timeout_secs,
        config.network.write_timeout_secs
    );

    let store: Arc<dyn RelayStore> = if config.storage.persist {
        tracing::info!("  Data directory: {}", config.storage.data_dir.display());
        Arc::new(
            Storage::open(&config.storage.data_dir)?
                .with_compact_threshold(config.storage.compact_threshold_bytes),
        )
    } else {
        tracing::info!("  Storage: in-memory (state is lost on exit)");
        Arc::new(Storage::in_memory())
    };

    let mut server_config = ServerConfig::new(bind_addr)
        .with_max_connections(config.network.max_connections)
        .with_limits(ConnectionLimits {
            read_timeout: config.network.read_timeout(),
            write_timeout: config.network.write_timeout(),
            max_content_bytes: config.network.max_content_bytes,
        });

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled on {}", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, store));

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = server.handler().store().stats();
    tracing::info!(
        "Server stopped ({} clients, {} queued messages)",
        stats.clients,
        stats.queued_messages
    );
    Ok(())
}
