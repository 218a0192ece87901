use std::error::Error;
use std::sync::Arc;

use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::client::OAuthToken;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::credentials::TokenCache;
use crate::transport::CommitError;

/// rdkafka client context shared by the consumer and the producer:
/// - hands out OAUTHBEARER tokens from the token cache,
/// - reports liveness and exports client gauges from the statistics callback,
/// - logs rebalances and asynchronous commit results.
pub struct KafkaClientContext {
    liveness: Option<HealthHandle>,
    tokens: Option<Arc<TokenCache>>,
}

impl KafkaClientContext {
    pub fn new(liveness: Option<HealthHandle>, tokens: Option<Arc<TokenCache>>) -> Self {
        Self { liveness, tokens }
    }

    pub fn tokens(&self) -> Option<Arc<TokenCache>> {
        self.tokens.clone()
    }
}

impl ClientContext for KafkaClientContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn stats(&self, stats: Statistics) {
        // The main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        gauge!("kafka_client_callback_queue_depth").set(stats.replyq as f64);
        gauge!("kafka_client_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_client_queue_bytes").set(stats.msg_size as f64);

        for (_, broker) in stats.brokers {
            let id = broker.nodeid.to_string();
            gauge!("kafka_client_broker_requests_pending", "broker" => id.clone())
                .set(broker.outbuf_cnt as f64);
            gauge!("kafka_client_broker_responses_awaiting", "broker" => id.clone())
                .set(broker.waitresp_cnt as f64);
            counter!("kafka_client_broker_tx_errors_total", "broker" => id.clone())
                .absolute(broker.txerrs);
            counter!("kafka_client_broker_rx_errors_total", "broker" => id)
                .absolute(broker.rxerrs);
        }
    }

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> Result<OAuthToken, Box<dyn Error>> {
        let Some(tokens) = &self.tokens else {
            return Err("OAUTHBEARER requested but no token provider is configured".into());
        };

        let token = tokens.token()?;
        debug!("handing out auth token valid until {}", token.expires_at);

        Ok(OAuthToken {
            lifetime_ms: token.expires_at_unix_ms(),
            principal_name: token.principal,
            token: token.token,
        })
    }
}

impl ConsumerContext for KafkaClientContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            // cooperative-sticky triggers these for every membership change, even when
            // no partition moves
            Rebalance::Revoke(partitions) if partitions.count() == 0 => {
                debug!("skipping empty revoke rebalance");
            }
            Rebalance::Revoke(partitions) => {
                counter!("kafka_rebalance_events_total", "event" => "revoke").increment(1);
                info!(
                    "revoking partitions {}, uncommitted batches for them will be redelivered",
                    describe(partitions)
                );
            }
            Rebalance::Assign(partitions) => {
                debug!("pre-rebalance assign of {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                counter!("kafka_rebalance_events_total", "event" => "error").increment(1);
                warn!("rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) if partitions.count() == 0 => {
                debug!("skipping empty assign rebalance");
            }
            Rebalance::Assign(partitions) => {
                counter!("kafka_rebalance_events_total", "event" => "assign").increment(1);
                info!("assigned partitions {}", describe(partitions));
            }
            Rebalance::Revoke(_) => debug!("post-rebalance revoke"),
            Rebalance::Error(e) => warn!("post-rebalance error: {}", e),
        }
    }

    /// Only called for asynchronous commits; synchronous commits return their
    /// result to the caller directly.
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("committed offsets {}", describe(offsets)),
            Err(e) => match CommitError::from(e) {
                CommitError::Fenced(reason) => {
                    counter!("kafka_commit_failures_total", "reason" => reason.as_str())
                        .increment(1);
                    warn!(
                        "async commit of {} fenced ({}), records will be reprocessed",
                        describe(offsets),
                        reason.as_str()
                    );
                }
                CommitError::Fatal(e) => {
                    counter!("kafka_commit_failures_total", "reason" => "fatal").increment(1);
                    warn!("async commit of {} failed: {}", describe(offsets), e);
                }
            },
        }
    }
}

fn describe(partitions: &TopicPartitionList) -> String {
    partitions
        .elements()
        .iter()
        .map(|p| format!("{}[{}]@{:?}", p.topic(), p.partition(), p.offset()))
        .collect::<Vec<_>>()
        .join(", ")
}
