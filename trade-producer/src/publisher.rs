use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use common_kafka::producer::{KafkaProduceError, KafkaProducer};
use futures::future::BoxFuture;
use futures::FutureExt;
use health::HealthHandle;
use metrics::{counter, gauge};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::pacing::{PacingAction, RateSchedule, SEND_QUANTUM};
use crate::trade::Trade;

const PAUSED_TICK: Duration = Duration::from_secs(10);

/// Where trades are published. Sends only enqueue; the returned future resolves
/// once the broker acknowledged (or gave up on) the record.
pub trait TradeSink: Send + Sync {
    type Ack: Future<Output = Result<(), KafkaProduceError>> + Send + 'static;

    fn send(&self, trade: &Trade) -> Result<Self::Ack, KafkaProduceError>;

    fn flush(&self, timeout: Duration) -> Result<(), KafkaProduceError>;
}

impl TradeSink for KafkaProducer {
    type Ack = BoxFuture<'static, Result<(), KafkaProduceError>>;

    fn send(&self, trade: &Trade) -> Result<Self::Ack, KafkaProduceError> {
        let delivery = self.send_json(trade.key(), trade)?;
        Ok(KafkaProducer::process_ack(delivery).boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<(), KafkaProduceError> {
        KafkaProducer::flush(self, timeout).map_err(KafkaProduceError::Kafka)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub backpressure: u64,
}

/// Publishes random trades at the schedule's rate until shutdown.
pub struct TradePublisher<S: TradeSink> {
    sink: S,
    schedule: RateSchedule,
    acks: JoinSet<Result<(), KafkaProduceError>>,
    rng: StdRng,
    flush_timeout: Duration,
    liveness: HealthHandle,
    summary: PublishSummary,
}

impl<S: TradeSink> TradePublisher<S> {
    pub fn new(
        sink: S,
        schedule: RateSchedule,
        flush_timeout: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            sink,
            schedule,
            acks: JoinSet::new(),
            rng: StdRng::from_entropy(),
            flush_timeout,
            liveness,
            summary: PublishSummary::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub async fn run<F>(mut self, shutdown: F) -> Result<PublishSummary, KafkaProduceError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        gauge!("producer_target_rate").set(f64::from(self.schedule.target_rate()));

        let result = if self.schedule.is_paused() {
            info!("producer paused: MESSAGES_PER_SECOND=0 (not sending messages)");
            loop {
                self.liveness.report_healthy();
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break Ok(()),
                    _ = tokio::time::sleep(PAUSED_TICK) => {}
                }
            }
        } else {
            info!(
                "starting continuous producer: {} messages/second, target interval {:?}",
                self.schedule.target_rate(),
                self.schedule.interval().unwrap_or_default()
            );
            self.publish(shutdown.as_mut()).await
        };

        info!(
            "stopping producer, total messages sent: {}",
            self.summary.sent
        );
        if let Err(e) = self.sink.flush(self.flush_timeout) {
            error!("failed to flush pending records: {}", e);
        }
        while let Some(joined) = self.acks.join_next().await {
            self.reap(joined);
        }

        result.map(|()| self.summary)
    }

    async fn publish<F>(&mut self, mut shutdown: Pin<&mut F>) -> Result<(), KafkaProduceError>
    where
        F: Future<Output = ()>,
    {
        // Kept across backpressure retries so a record is never skipped
        let mut pending: Option<Trade> = None;

        loop {
            while let Some(joined) = self.acks.try_join_next() {
                self.reap(joined);
            }

            let now = Instant::now();
            let wait = match self.schedule.next_action(now) {
                PacingAction::Paused => Some(PAUSED_TICK),
                PacingAction::Wait(quantum) => Some(quantum),
                PacingAction::Send => {
                    let trade = pending
                        .take()
                        .unwrap_or_else(|| Trade::random(&mut self.rng, Utc::now()));

                    match self.sink.send(&trade) {
                        Ok(ack) => {
                            self.acks.spawn(ack);
                            self.schedule.record_sent();
                            self.summary.sent += 1;
                            counter!("producer_messages_sent_total").increment(1);
                            self.maybe_report(now);
                            None
                        }
                        Err(KafkaProduceError::QueueFull) => {
                            // The client is not keeping up: retry the same record, the
                            // schedule catches up once the queue drains
                            self.summary.backpressure += 1;
                            counter!("producer_backpressure_total").increment(1);
                            pending = Some(trade);
                            Some(SEND_QUANTUM)
                        }
                        Err(e) => {
                            error!("failed to enqueue trade {}: {}", trade.trade_id, e);
                            return Err(e);
                        }
                    }
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => {
                    if shutdown.as_mut().now_or_never().is_some() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn maybe_report(&mut self, now: Instant) {
        if let Some(report) = self.schedule.report(now) {
            info!(
                "sent: {} messages, rate: {:.1} msg/s, target: {} msg/s",
                report.sent, report.achieved_rate, report.target_rate
            );
            gauge!("producer_achieved_rate").set(report.achieved_rate);
            self.liveness.report_healthy();
        }
    }

    fn reap(&mut self, joined: Result<Result<(), KafkaProduceError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => self.summary.delivered += 1,
            // Already counted and logged by the ack future
            Ok(Err(_)) => self.summary.failed += 1,
            Err(e) => {
                self.summary.failed += 1;
                warn!("delivery task failed: {}", e);
            }
        }
    }
}
