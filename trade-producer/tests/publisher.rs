use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_kafka::producer::KafkaProduceError;
use futures::future::{ready, Ready};
use health::HealthRegistry;
use tokio::time::Instant;
use trade_producer::pacing::RateSchedule;
use trade_producer::publisher::{TradePublisher, TradeSink};
use trade_producer::trade::Trade;

#[derive(Default)]
struct SinkState {
    attempts: Mutex<Vec<Trade>>,
    queue_full: AtomicU32,
    flushes: AtomicUsize,
}

/// Records every attempted send; the first `queue_full` attempts are rejected
/// as if the local producer queue was full.
#[derive(Clone, Default)]
struct MockSink {
    state: Arc<SinkState>,
}

impl MockSink {
    fn rejecting(queue_full: u32) -> Self {
        let sink = Self::default();
        sink.state.queue_full.store(queue_full, Ordering::SeqCst);
        sink
    }

    fn attempts(&self) -> Vec<Trade> {
        self.state.attempts.lock().unwrap().clone()
    }

    fn flushes(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }
}

impl TradeSink for MockSink {
    type Ack = Ready<Result<(), KafkaProduceError>>;

    fn send(&self, trade: &Trade) -> Result<Self::Ack, KafkaProduceError> {
        self.state.attempts.lock().unwrap().push(trade.clone());
        let rejected = self
            .state
            .queue_full
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(KafkaProduceError::QueueFull);
        }
        Ok(ready(Ok(())))
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaProduceError> {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn publisher(sink: MockSink, rate: u32) -> TradePublisher<MockSink> {
    let registry = HealthRegistry::new("liveness");
    TradePublisher::new(
        sink,
        RateSchedule::new(rate, Instant::now()),
        Duration::from_secs(5),
        registry.register("producer_loop", time::Duration::seconds(30)),
    )
}

#[tokio::test(start_paused = true)]
async fn publishes_at_target_rate() {
    let sink = MockSink::default();
    let publisher = publisher(sink.clone(), 100);

    let summary = publisher
        .run(tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    assert!((99..=101).contains(&summary.sent), "sent {}", summary.sent);
    assert_eq!(summary.delivered, summary.sent);
    assert_eq!(summary.failed, 0);
    assert_eq!(sink.attempts().len() as u64, summary.sent);
    assert_eq!(sink.flushes(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_rate_sends_nothing() {
    let sink = MockSink::default();
    let publisher = publisher(sink.clone(), 0);

    let summary = publisher
        .run(tokio::time::sleep(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(summary.sent, 0);
    assert!(sink.attempts().is_empty());
    assert_eq!(sink.flushes(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_retries_the_same_trade() {
    let sink = MockSink::rejecting(3);
    let publisher = publisher(sink.clone(), 10);

    let summary = publisher
        .run(tokio::time::sleep(Duration::from_millis(550)))
        .await
        .unwrap();

    // Sends due at 0, 100, ..., 500ms; the first one only went through on its fourth attempt
    assert_eq!(summary.backpressure, 3);
    assert_eq!(summary.sent, 6);

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 9);
    assert!(attempts[..4]
        .iter()
        .all(|t| t.trade_id == attempts[0].trade_id && t.account_id == attempts[0].account_id));
}
