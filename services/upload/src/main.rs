use anyhow::{Context, Result};
use pixtally_pipeline::{
    CancellationToken, DeadLetterSink, EventConsumer, EventPublisher, KafkaMessageSource,
    KafkaProducer,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_service::config::{BlobBackend, BlobStoreConfig, Config};
use upload_service::{
    start_api_server, AggregationHandler, AppState, BlobStore, IngestionService, LocalBlobStore,
    PgStore, S3BlobStore, StaticCredentialStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Pixtally upload service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgStore::new(&config.database)
            .await
            .context("Failed to initialize database store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blobs = init_blob_store(&config.blob_store).await?;

    let producer = Arc::new(
        KafkaProducer::new(config.kafka.clone()).context("Failed to initialize Kafka producer")?,
    );

    let ingestion = Arc::new(IngestionService::new(
        store.clone(),
        store.clone(),
        blobs,
        producer.clone() as Arc<dyn EventPublisher>,
        config.kafka.publish_timeout(),
    ));

    // Aggregation consumer
    let source = Arc::new(
        KafkaMessageSource::new(&config.kafka).context("Failed to initialize Kafka consumer")?,
    );
    let handler = Arc::new(AggregationHandler::new(
        store.clone(),
        store.clone(),
        config.kafka.retry_policy(),
        config.kafka.handle_timeout(),
    ));
    let consumer = EventConsumer::new(source, handler, config.kafka.retry_policy())
        .with_dead_letters(producer.clone() as Arc<dyn DeadLetterSink>);

    let api_state = AppState {
        ingestion,
        links: store.clone(),
        images: store.clone(),
        statistics: store.clone(),
        credentials: Arc::new(StaticCredentialStore::new(config.auth.tokens.clone())),
        health: store.clone(),
        limits: config.statistics,
        public_base_url: config.api.public_base_url.clone(),
    };

    let cancel = CancellationToken::new();

    // Spawn Kafka consumer task
    let consumer_cancel = cancel.clone();
    let consumer_handle = tokio::spawn(async move {
        consumer.run(consumer_cancel).await;
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %format!("{e:#}"), "API server error");
        }
    });

    info!("Upload service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload service");
    cancel.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Aggregation consumer task failed");
    }

    info!("Upload service stopped");

    Ok(())
}

async fn init_blob_store(config: &BlobStoreConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend {
        BlobBackend::Local => {
            info!(root = %config.local_root.display(), "Using local blob store");
            Ok(Arc::new(LocalBlobStore::new(config.local_root.clone())))
        }
        BlobBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .context("blob_store.s3 is required for the s3 backend")?;
            let store = S3BlobStore::new(s3)
                .await
                .context("Failed to initialize S3 blob store")?;
            Ok(Arc::new(store))
        }
    }
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
