//! Publish simulated trades to Kafka at a steady target rate.
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use common_kafka::producer::KafkaProducer;
use common_kafka::{token_cache_for, KafkaClientContext};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use trade_producer::config::Config;
use trade_producer::pacing::RateSchedule;
use trade_producer::publisher::TradePublisher;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

async fn shutdown_signal() {
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!(
        "starting trade producer for topic {} at {} messages/second",
        config.topic, config.messages_per_second
    );

    let liveness = HealthRegistry::new("liveness");
    let loop_liveness = liveness.register("producer_loop", time::Duration::seconds(30));
    let client_liveness = liveness.register("rdkafka", time::Duration::seconds(30));

    let router = Router::new()
        .route("/", get(|| async { "trade producer" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    let router = common_metrics::setup_metrics_routes(router)
        .context("failed to install metrics recorder")?;

    let bind = config.bind();
    let (stop_server, server_stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        info!("serving metrics on {}", bind);
        let shutdown = async {
            _ = server_stopped.await;
        };
        if let Err(e) = common_metrics::serve(router, &bind, shutdown).await {
            error!("metrics server failed: {}", e);
        }
    });

    let tokens = token_cache_for(&config.kafka)
        .await
        .context("failed to set up MSK IAM authentication")?;
    let context = KafkaClientContext::new(Some(client_liveness), tokens);
    let producer = KafkaProducer::new(&config.kafka, &config.producer, &config.topic, context)
        .context("failed to create Kafka producer")?;

    let publisher = TradePublisher::new(
        producer,
        RateSchedule::new(config.messages_per_second, Instant::now()),
        FLUSH_TIMEOUT,
        loop_liveness,
    );
    let result = publisher.run(shutdown_signal()).await;

    _ = stop_server.send(());
    if let Err(e) = server.await {
        error!("metrics server task failed: {}", e);
    }

    let summary = result.context("producer loop failed")?;
    info!(
        "producer stopped: {} sent, {} delivered, {} failed",
        summary.sent, summary.delivered, summary.failed
    );
    Ok(())
}
