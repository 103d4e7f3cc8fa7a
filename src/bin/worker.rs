use std::sync::Arc;

use imggo_pipeline::{
    config::AppConfig,
    db,
    routes::metrics::describe_metrics,
    services::{
        inference::WorkersAiClient, queue::RedisQueue, webhook::WebhookDispatcher, worker::Worker,
    },
    store::PgStore,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting manifest worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let settings = config.worker_settings();

    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgStore::new(db_pool));

    let queue = RedisQueue::new(&config.redis_url, &config.queue_name)
        .expect("Failed to initialize job queue");

    let inference = WorkersAiClient::new(
        &config.cf_account_id,
        &config.cf_api_token,
        &config.inference_model,
        config.inference_timeout(),
    )
    .expect("Failed to initialize Workers AI client");

    let webhooks = WebhookDispatcher::new(store.clone(), config.webhook_timeout())
        .expect("Failed to initialize webhook dispatcher");

    let worker = Worker::new(
        Arc::new(queue),
        store.clone(),
        store,
        Arc::new(inference),
        webhooks,
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(queue = %config.queue_name, "Worker ready, starting job processing loop");
    worker.run(shutdown_rx).await;
}
