use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::QUEUE_DEPTH;
use crate::types::{JobStatus, QueueStats};

/// Bind a `TcpListener` on `bind` and serve `router` on it until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the Prometheus recorder and build a `Router` exposing it at `/metrics`.
/// Callers may add more routes, like a liveness probe, before serving it.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Publish the number of jobs in each status of `queue_name` as gauges.
pub fn record_queue_stats(queue_name: &str, stats: &QueueStats) {
    for status in [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        let labels = [
            ("queue", queue_name.to_owned()),
            ("status", status.as_str().to_owned()),
        ];
        metrics::gauge!(QUEUE_DEPTH, &labels).set(stats.get(status) as f64);
    }
}

/// Middleware recording request counts and latencies per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
