use anyhow::Context;
use axum::{routing::get, Router};
use sensorhub::config::{Config, StorageBackend};
use sensorhub::decode::DecodeOptions;
use sensorhub::lifecycle::{spawn_lifecycle, LifecycleSettings};
use sensorhub::metrics;
use sensorhub::mqtt::{self, MqttSettings};
use sensorhub::query::QueryService;
use sensorhub::rest;
use sensorhub::store::{MemoryStore, PgStore, ReadingStore};
use sensorhub::worker::{Ingestor, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;

    info!("Starting sensorhub");
    info!("MQTT broker: {}:{} topic {}", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics().context("Failed to register metrics")?;

    let (store, lifecycle_store): (Arc<dyn ReadingStore>, Arc<dyn ReadingStore>) =
        match config.storage_backend {
            StorageBackend::Postgres => {
                info!("Database: {}", config.redacted_database_url());
                let store =
                    PgStore::connect(&config.database_url, config.db_max_connections, true)
                        .await
                        .context("Failed to connect to database")?;
                // Lifecycle jobs get their own small pool.
                let lifecycle = PgStore::connect(
                    &config.database_url,
                    config.lifecycle_max_connections,
                    false,
                )
                .await
                .context("Failed to connect lifecycle pool")?;
                let store: Arc<dyn ReadingStore> = Arc::new(store);
                let lifecycle: Arc<dyn ReadingStore> = Arc::new(lifecycle);
                (store, lifecycle)
            }
            StorageBackend::Memory => {
                warn!("Using in-memory storage, readings are lost on exit");
                let store: Arc<dyn ReadingStore> = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };

    let shutdown = CancellationToken::new();

    let ingestor = Ingestor::new(
        store.clone(),
        DecodeOptions {
            legacy_positional: config.legacy_payloads,
        },
        RetryPolicy::new(config.write_max_attempts),
    );
    info!("Worker pool size: {}", config.worker_pool_size);
    let mut mqtt_handle = tokio::spawn(mqtt::run_mqtt(
        MqttSettings::from_config(&config),
        ingestor,
        shutdown.clone(),
    ));

    let lifecycle_handles = spawn_lifecycle(
        lifecycle_store.clone(),
        LifecycleSettings {
            retention: config.retention(),
            ttl_interval: Duration::from_secs(config.ttl_sweep_interval_secs.max(1)),
            archive_after: config.archive_after(),
            archive_interval: Duration::from_secs(config.archive_interval_secs.max(1)),
            archive_batch_size: config.archive_batch_size,
        },
        shutdown.clone(),
    );

    // Build HTTP app with REST API and metrics endpoint
    let queries = QueryService::new(store.clone(), config.max_page_size, config.query_timeout());
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(queries));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let mut mqtt_result = None;
    let mut server_result = None;
    tokio::select! {
        res = &mut mqtt_handle => {
            error!("MQTT task terminated");
            mqtt_result = Some(res);
        }
        res = &mut server_handle => {
            error!("HTTP server terminated");
            server_result = Some(res);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    shutdown.cancel();

    let mqtt_result = match mqtt_result {
        Some(res) => res,
        None => mqtt_handle.await,
    };
    let server_result = match server_result {
        Some(res) => res,
        None => server_handle.await,
    };
    for handle in lifecycle_handles {
        if let Err(e) = handle.await {
            warn!("Lifecycle task ended abnormally: {}", e);
        }
    }

    lifecycle_store.close().await;
    store.close().await;

    if let Err(e) = server_result.context("HTTP server task panicked")? {
        error!("HTTP server error: {}", e);
        return Err(e.into());
    }
    match mqtt_result.context("MQTT task panicked")? {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("MQTT task failed: {}", e);
            Err(e.into())
        }
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
