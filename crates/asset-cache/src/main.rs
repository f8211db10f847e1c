//! Asset Cache - offline-first cache for a web application's static assets

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use asset_cache_api::{AppState, create_router};
use asset_cache_core::{AssetCacheManager, expand_base_resources};
use asset_cache_proxy::{OriginClient, OriginClientConfig};
use asset_cache_storage::{CacheStorage, LocalStorage, MemoryStorage};
use config::{Config, LogFormat, LoggingConfig, StorageBackend};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Asset Cache - offline-first cache for static web assets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "ASSET_CACHE_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "ASSET_CACHE_PORT")]
    port: Option<u16>,

    /// Generation label installed at startup
    #[arg(long, env = "ASSET_CACHE_VERSION")]
    version_label: Option<String>,

    /// Bearer token for the install and activate routes
    #[arg(long, env = "ASSET_CACHE_MANAGEMENT_TOKEN", hide_env_values = true)]
    management_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(version) = args.version_label {
        config.cache.version = version;
        config.validate()?;
    }

    if args.management_token.is_some() {
        config.management.token = args.management_token;
    }

    init_logging(&config.logging);

    info!("Starting Asset Cache v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(Arc::new(handle))
    } else {
        None
    };

    // Initialize storage backend
    let storage: Arc<dyn CacheStorage> = match config.storage.backend {
        StorageBackend::Local => Arc::new(
            LocalStorage::new(&config.storage.path)
                .await
                .with_context(|| format!("Failed to open storage at {}", config.storage.path))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };

    // Initialize origin client
    let origin = Arc::new(OriginClient::new(OriginClientConfig {
        url: config.origin.url.clone(),
        timeout: config.origin.timeout(),
        skip_tls_verify: config.origin.skip_tls_verify,
    })?);

    let manager = Arc::new(AssetCacheManager::new(storage, origin));

    // Install the configured generation and take over immediately
    let version = config.cache.version.clone();
    let resources = expand_base_resources(&config.cache.base_resources, &version);
    if let Err(e) = manager.install(&version, &resources).await {
        warn!("Continuing with a partially installed generation: {}", e);
    }
    manager.activate(&version).await?;

    if config.management.token.is_none() {
        info!("No management token configured, install and activate routes are disabled");
    }
    let state = AppState::new(manager.clone(), config.cache.base_resources.clone())
        .with_management_token(config.management.token.clone());
    let app = create_router(state, metrics_handle).layer(TraceLayer::new_for_http());

    // Determine bind address
    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);
    info!("Origin: {}", config.origin.url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.settle().await;
    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
