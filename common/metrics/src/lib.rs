use std::future::Future;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusRecorder};

/// Histogram buckets, in seconds. Batch processing sits around one second with
/// default settings and message age can grow to minutes while a group rebalances.
const SECONDS_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Bind a `TcpListener` on `bind` and serve `router` until `shutdown` resolves.
pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Install the process-wide Prometheus recorder and add the `/metrics` route and
/// request middleware to `router`. Must be called once per process, after every
/// other route was added.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = builder()?.install_recorder()?;

    Ok(router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_metrics)))
}

/// Standalone recorder with the same buckets, for tests and local recording.
pub fn build_recorder() -> Result<PrometheusRecorder, BuildError> {
    Ok(builder()?.build_recorder())
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets(SECONDS_BUCKETS)
}

/// Counts requests and their latency per matched route. Scrapes of `/metrics`
/// itself are not recorded.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path(), MatchedPath::as_str)
        .to_owned();
    if route == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().as_str().to_owned();
    let timer = Instant::now();
    let response = next.run(req).await;
    let elapsed = timer.elapsed().as_secs_f64();

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_str().to_owned()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(elapsed);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histograms_render_with_second_buckets() {
        let recorder = build_recorder().expect("failed to build recorder");
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!("kafka_batch_processing_seconds").record(1.2);
            metrics::counter!("kafka_messages_processed_total", "status" => "success")
                .increment(3);
        });

        let rendered = handle.render();
        assert!(rendered.contains("kafka_batch_processing_seconds_bucket{le=\"2.5\"} 1"));
        assert!(rendered.contains("kafka_batch_processing_seconds_bucket{le=\"0.5\"} 0"));
        assert!(rendered.contains("kafka_messages_processed_total{status=\"success\"} 3"));
    }
}
