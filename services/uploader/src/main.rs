use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_service::capture::adapter_from_config;
use upload_service::{
    start_api_server, AppState, CaptureController, Config, HttpUploadTransport, ImageStore,
    ProgressBus, UploadCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting image upload service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = ImageStore::connect(&config.database)
        .await
        .context("Failed to initialize image store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let transport = Arc::new(
        HttpUploadTransport::new(&config.upload).context("Failed to initialize upload transport")?,
    );

    let bus = ProgressBus::new(config.bus.capacity);

    let coordinator = UploadCoordinator::new(
        store.clone(),
        transport,
        bus.clone(),
        config.upload.upload_concurrency,
    );

    if config.upload.reconcile_on_startup {
        coordinator
            .reconcile()
            .await
            .context("Failed to reconcile image catalog")?;
    }

    let capture = Arc::new(CaptureController::new(
        store.clone(),
        adapter_from_config(&config.capture),
        config.capture.image_dir.clone(),
    ));

    // Create API state
    let api_state = AppState {
        store: store.clone(),
        coordinator: coordinator.clone(),
        capture,
        bus,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Upload service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload service");

    // Stop accepting triggers, then let running transfers record their outcome
    api_handle.abort();

    let in_flight = coordinator.in_flight();
    if in_flight > 0 {
        info!(in_flight, "Waiting for in-flight uploads");
    }
    if tokio::time::timeout(config.shutdown_grace(), coordinator.wait_idle())
        .await
        .is_err()
    {
        warn!(
            in_flight = coordinator.in_flight(),
            "Shutdown grace period elapsed; interrupted uploads are marked failed on next start"
        );
    }

    store.close().await;

    info!("Upload service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
