use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_gateway::{
    start_api_server, AppState, Config, Gateway, IngestBuffer, ReadingSink, SessionRegistry,
    TelemetryStore,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting telemetry gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize storage
    let store = Arc::new(
        TelemetryStore::new(&config.database)
            .await
            .context("Failed to initialize telemetry store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let registry = Arc::new(SessionRegistry::new(store.clone()));
    let buffer = Arc::new(IngestBuffer::new(
        config.buffer.clone(),
        store.clone() as Arc<dyn ReadingSink>,
    ));
    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        registry,
        buffer.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Spawn the timer-driven buffer flush
    let flush_handle = tokio::spawn(buffer.clone().run_timer());

    // Spawn the connection health checker
    let health_handle = tokio::spawn(
        gateway
            .clone()
            .run_health_checker(shutdown.child_token()),
    );

    // Spawn the API server
    let api_state = AppState {
        gateway: gateway.clone(),
        buffer: buffer.clone(),
        store: store.clone(),
    };
    let gateway_config = config.gateway.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &gateway_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        host = %config.gateway.host,
        port = config.gateway.port,
        "Telemetry gateway started"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down telemetry gateway");

    shutdown.cancel();
    api_handle.abort();
    let _ = health_handle.await;

    // Stop the timer and flush whatever is still buffered.
    buffer.shutdown().await;
    let _ = flush_handle.await;

    info!("Telemetry gateway stopped");

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
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
