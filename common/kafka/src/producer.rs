use std::time::Duration;

use metrics::counter;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{KafkaConfig, ProducerConfig};
use crate::context::KafkaClientContext;

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("local producer queue is full")]
    QueueFull,
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[source] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

/// Producer side of the Kafka transport. Sends are enqueued into librdkafka,
/// which batches and pipelines them; delivery is acknowledged through the
/// returned future.
pub struct KafkaProducer {
    producer: FutureProducer<KafkaClientContext>,
    topic: String,
}

impl KafkaProducer {
    pub fn new(
        kafka: &KafkaConfig,
        config: &ProducerConfig,
        topic: &str,
        context: KafkaClientContext,
    ) -> Result<Self, KafkaError> {
        info!("connecting producer to {}", kafka.bootstrap_servers);

        let mut client_config = kafka.client_config();
        config.apply(&mut client_config);
        debug!("rdkafka producer configuration: {:?}", client_config);

        let producer: FutureProducer<KafkaClientContext> =
            client_config.create_with_context(context)?;

        // "Ping" the brokers by requesting metadata for our topic
        match producer
            .client()
            .fetch_metadata(Some(topic), Duration::from_secs(15))
        {
            Ok(metadata) => info!(
                "connected to Kafka brokers, {} has {} partitions",
                topic,
                metadata
                    .topics()
                    .first()
                    .map(|t| t.partitions().len())
                    .unwrap_or_default()
            ),
            Err(e) => {
                error!("failed to fetch metadata from Kafka brokers: {}", e);
                return Err(e);
            }
        }

        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue one JSON record under `key` without waiting for the broker.
    pub fn send_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<DeliveryFuture, KafkaProduceError> {
        let payload = serde_json::to_string(value)?;
        self.send(key, payload.as_bytes())
    }

    pub fn send(&self, key: &str, payload: &[u8]) -> Result<DeliveryFuture, KafkaProduceError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        match self.producer.send_result(record) {
            Ok(delivery) => Ok(delivery),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                Err(KafkaProduceError::QueueFull)
            }
            Err((e, _)) => Err(KafkaProduceError::Kafka(e)),
        }
    }

    /// Wait for the broker acknowledgement of one send, counting the outcome.
    pub async fn process_ack(delivery: DeliveryFuture) -> Result<(), KafkaProduceError> {
        match delivery.await {
            Ok(Ok(_)) => {
                counter!("producer_messages_delivered_total", "status" => "success").increment(1);
                Ok(())
            }
            Ok(Err((e, _))) => {
                counter!("producer_messages_delivered_total", "status" => "error").increment(1);
                error!("failed to deliver record: {}", e);
                Err(KafkaProduceError::Kafka(e))
            }
            Err(_) => {
                // Dropped by the producer, after message.timeout.ms of retries
                counter!("producer_messages_delivered_total", "status" => "canceled").increment(1);
                error!("record delivery canceled before acknowledgement");
                Err(KafkaProduceError::Canceled)
            }
        }
    }

    /// Records enqueued locally or in flight to the brokers.
    pub fn in_flight_count(&self) -> i32 {
        self.producer.in_flight_count()
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}
