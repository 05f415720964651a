//! Consume a PostgreSQL-backed job queue, delivering every job to a webhook.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use queue_common::health::HealthRegistry;
use queue_common::metrics::{record_queue_stats, serve, setup_metrics_router};
use queue_common::{PgStore, Queue};
use queue_worker::config::Config;
use queue_worker::webhook::WebhookHandler;
use queue_worker::worker::WorkerPool;

const STATS_INTERVAL: Duration = Duration::from_secs(15);

async fn report_stats_loop(queue: Queue, queue_name: String) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);

    loop {
        interval.tick().await;
        match queue.stats(&queue_name).await {
            Ok(stats) => record_queue_stats(&queue_name, &stats),
            Err(error) => error!("failed to read queue stats: {error}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let store = PgStore::new(
        config.table_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "queue-worker",
    )?;
    store.run_migrations().await?;

    let queue = Queue::new(Arc::new(store)).with_retry_policy(config.retry_policy.provide());
    let handler = WebhookHandler::new(&config.webhook_url, config.request_timeout.0)?;

    let liveness = HealthRegistry::new("liveness");
    let pool = WorkerPool::new(queue.clone(), handler, config.pool_config())
        .with_liveness(liveness.clone());

    let router = setup_metrics_router()?.route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!("failed to serve metrics on {bind}: {error}");
        }
    });
    tokio::spawn(report_stats_loop(
        queue,
        config.queue_name.as_str().to_owned(),
    ));

    let handle = pool.start()?;
    info!(queue = config.queue_name.as_str(), "queue-worker running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down worker pool");
    if !handle.shutdown(config.shutdown_grace.0).await {
        error!("some jobs were abandoned mid-execution, they come back once their leases expire");
    }

    Ok(())
}
