mod api;
mod config;
mod detection;
mod events;
mod gallery;
mod ingest;
mod object_store;
mod record_store;
mod status;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use detection::RekognitionDetector;
use events::EventProcessor;
use gallery::GalleryService;
use ingest::NotificationConsumer;
use object_store::S3ObjectStore;
use record_store::PgRecordStore;
use status::StatusTracker;
use std::sync::Arc;
use tokio::signal;
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
        "Starting Pictor image analysis service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let records: Arc<dyn record_store::RecordStore> = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    let objects: Arc<dyn object_store::ObjectStore> =
        Arc::new(S3ObjectStore::new(&config.s3).await);

    let detector: Arc<dyn detection::DetectionService> =
        Arc::new(RekognitionDetector::new(&config.detection, &config.s3.region).await);

    let tracker = StatusTracker::new(records.clone());

    let processor = Arc::new(EventProcessor::new(
        objects.clone(),
        detector.clone(),
        records.clone(),
        tracker.clone(),
    ));

    // Create Kafka consumer
    let consumer = NotificationConsumer::new(&config.kafka, processor)
        .context("Failed to initialize Kafka consumer")?;

    let gallery = Arc::new(GalleryService::new(
        objects.clone(),
        detector.clone(),
        records.clone(),
        config.s3.upload_prefix.clone(),
        config.presigned_url_expiry(),
    ));

    // Create API state
    let api_state = AppState {
        objects: objects.clone(),
        detector: detector.clone(),
        records: records.clone(),
        tracker: tracker.clone(),
        gallery,
        region: config.s3.region.clone(),
        upload_prefix: config.s3.upload_prefix.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn Kafka consumer task
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Image analysis service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down image analysis service");

    // Abort tasks
    consumer_handle.abort();
    api_handle.abort();

    info!("Image analysis service stopped");

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
