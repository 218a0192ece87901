//! Consume a Kafka topic in micro-batches, committing offsets after each processed batch.
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use common_kafka::{token_cache_for, KafkaClientContext, KafkaTransport};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use microbatch_consumer::assembler::BatchAssembler;
use microbatch_consumer::config::Config;
use microbatch_consumer::consumer::BatchConsumer;
use microbatch_consumer::processor::{BatchProcessor, SimulatedWorkHandler};

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
    config.validate().context("invalid configuration")?;

    info!(
        "starting micro-batch consumer for topic {} as group {}",
        config.consumer.topic, config.consumer.group_id
    );
    info!(
        "batch size: {}, batch timeout: {:?}, poll timeout: {:?}",
        config.batch_size, config.batch_timeout.0, config.poll_timeout.0
    );

    let liveness = HealthRegistry::new("liveness");
    let loop_liveness = liveness.register("consumer_loop", time::Duration::seconds(60));
    let client_liveness = liveness.register("rdkafka", time::Duration::seconds(30));

    let router = Router::new()
        .route("/", get(|| async { "micro-batch consumer" }))
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
    let transport = KafkaTransport::new(&config.kafka, &config.consumer, context)
        .context("failed to create Kafka consumer")?;

    let consumer = BatchConsumer::new(
        transport,
        BatchAssembler::new(config.batch_size, config.batch_timeout.0),
        BatchProcessor::new(
            SimulatedWorkHandler::new(config.message_processing_time.0),
            config.batch_processing_time.0,
            &config.consumer.group_id,
        ),
        config.poll_timeout.0,
        loop_liveness,
    );

    let result = consumer.run(shutdown_signal()).await;

    _ = stop_server.send(());
    if let Err(e) = server.await {
        error!("metrics server task failed: {}", e);
    }

    result.context("consumer loop failed")
}
