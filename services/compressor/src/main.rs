use anyhow::{Context, Result};
use pixpress::{
    start_api_server, AppState, BlobStore, Config, HttpRecommender, HttpRegionDetector,
    MemoryRecordStore, PgRecordStore, RecordStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Pixpress compressor"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let store = init_record_store(&config).await?;

    let blobs = Arc::new(
        BlobStore::new(&config.blob, &config.api.public_base_url)
            .await
            .context("Failed to initialize blob store")?,
    );

    let detector = Arc::new(
        HttpRegionDetector::new(&config.detection)
            .context("Failed to initialize region detector")?,
    );
    let recommender = Arc::new(
        HttpRecommender::new(&config.recommendation)
            .context("Failed to initialize recommender")?,
    );

    if config.detection.api_key.is_none() {
        warn!("No detection API key configured, uploads will have no detected regions");
    }
    if config.recommendation.api_key.is_none() {
        warn!("No generation API key configured, recommendations will use defaults");
    }

    let api_state = AppState::new(&config, store, blobs, detector, recommender);

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %format!("{e:#}"), "API server error");
        }
    });

    info!("Compressor started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down compressor");

    api_handle.abort();

    info!("Compressor stopped");

    Ok(())
}

/// PostgreSQL when a database URL is configured, process memory otherwise
async fn init_record_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    if config.database.url.is_none() {
        warn!("No database URL configured, records are kept in memory and lost on restart");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }

    let store = PgRecordStore::new(&config.database)
        .await
        .context("Failed to initialize record store")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
