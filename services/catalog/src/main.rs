use anyhow::{Context, Result};
use catalog_service::{
    start_api_server, AppState, CatalogStore, Config, InMemoryCatalogStore, PgCatalogStore,
    S3ObjectStore,
};
use reel_events::EventPublisher;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Reel Catalog Service"
    );

    init_metrics(config.service.metrics_port)?;

    let store: Arc<dyn CatalogStore> = if config.database.in_memory {
        warn!("Using in-memory catalog store, records are lost on restart");
        Arc::new(InMemoryCatalogStore::new())
    } else {
        let store = PgCatalogStore::connect(&config.database)
            .await
            .context("Failed to initialize catalog store")?;

        if config.database.run_migrations {
            store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }
        Arc::new(store)
    };

    let objects = Arc::new(S3ObjectStore::new(&config.s3).await);

    let publisher = Arc::new(
        EventPublisher::new(config.kafka.clone()).context("Failed to create event publisher")?,
    );

    let api_state = AppState {
        store,
        objects,
        events: publisher.clone(),
    };

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Shutting down catalog service");

    // The router and its state are gone once the server returns.
    match Arc::try_unwrap(publisher) {
        Ok(publisher) => {
            if let Err(e) = publisher.close(config.flush_timeout()) {
                error!(error = %e, "Failed to flush pending events");
            }
        }
        Err(_) => warn!("Event publisher still shared at shutdown, skipping flush"),
    }

    info!("Catalog service stopped");

    Ok(())
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
