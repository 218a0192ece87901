use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{CommitCheckpoint, CommitError, OffsetCommitter, Record};
use metrics::{counter, gauge, histogram};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assembler::Batch;
use crate::error::{ProcessingError, RecordError};
use crate::metrics_consts::{
    BATCH_PROCESSING_SECONDS, BATCH_SIZE, COMMIT_FAILURES, MESSAGES_PER_SECOND,
    MESSAGES_PROCESSED, MESSAGE_AGE_SECONDS,
};

/// Per-record business logic.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Result<(), RecordError>;
}

/// Stand-in for real work: the payload must be JSON, then we sleep.
pub struct SimulatedWorkHandler {
    message_processing_time: Duration,
}

impl SimulatedWorkHandler {
    pub fn new(message_processing_time: Duration) -> Self {
        Self {
            message_processing_time,
        }
    }
}

#[async_trait]
impl RecordHandler for SimulatedWorkHandler {
    async fn handle(&self, record: &Record) -> Result<(), RecordError> {
        let payload = record.payload.as_deref().ok_or(RecordError::MissingPayload)?;
        let _value: serde_json::Value = serde_json::from_slice(payload)?;

        if !self.message_processing_time.is_zero() {
            tokio::time::sleep(self.message_processing_time).await;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub records: usize,
    /// False when a rebalance fenced the commit: the records will be redelivered.
    pub committed: bool,
    pub checkpoint: CommitCheckpoint,
    pub duration: Duration,
}

/// Processes sealed batches and commits their offsets once every record succeeded.
pub struct BatchProcessor<H = SimulatedWorkHandler> {
    handler: H,
    batch_processing_time: Duration,
    group_id: String,
    started_at: Instant,
    total_processed: u64,
}

impl<H: RecordHandler> BatchProcessor<H> {
    pub fn new(handler: H, batch_processing_time: Duration, group_id: &str) -> Self {
        Self {
            handler,
            batch_processing_time,
            group_id: group_id.to_owned(),
            started_at: Instant::now(),
            total_processed: 0,
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub async fn process(
        &mut self,
        batch: Batch,
        committer: &dyn OffsetCommitter,
    ) -> Result<BatchReport, ProcessingError> {
        let start = Instant::now();
        info!("processing batch of {} records", batch.len());
        histogram!(BATCH_SIZE).record(batch.len() as f64);

        let result = self.process_inner(batch, committer).await;

        let duration = start.elapsed();
        histogram!(BATCH_PROCESSING_SECONDS).record(duration.as_secs_f64());

        match result {
            Ok((records, checkpoint, committed)) => {
                let elapsed = self.started_at.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    gauge!(MESSAGES_PER_SECOND).set(self.total_processed as f64 / elapsed);
                }
                Ok(BatchReport {
                    records,
                    committed,
                    checkpoint,
                    duration,
                })
            }
            Err(e) => {
                counter!(MESSAGES_PROCESSED, "status" => "error").increment(1);
                error!("error processing batch for group {}: {}", self.group_id, e);
                Err(e)
            }
        }
    }

    async fn process_inner(
        &mut self,
        batch: Batch,
        committer: &dyn OffsetCommitter,
    ) -> Result<(usize, CommitCheckpoint, bool), ProcessingError> {
        let records = batch.into_records();

        for record in &records {
            if let Err(source) = self.handler.handle(record).await {
                return Err(ProcessingError::Record {
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    source,
                });
            }

            if let Some(age) = message_age(record, OffsetDateTime::now_utc()) {
                histogram!(MESSAGE_AGE_SECONDS).record(age.as_secs_f64());
            }
            counter!(MESSAGES_PROCESSED, "status" => "success").increment(1);
            self.total_processed += 1;
        }

        if !self.batch_processing_time.is_zero() {
            tokio::time::sleep(self.batch_processing_time).await;
        }

        let checkpoint = CommitCheckpoint::from_records(&records);
        let committed = match committer.commit(&checkpoint) {
            Ok(()) => {
                debug!("committed {}", checkpoint);
                true
            }
            Err(CommitError::Fenced(reason)) => {
                counter!(COMMIT_FAILURES, "reason" => reason.as_str()).increment(1);
                warn!(
                    "commit of {} for group {} failed ({}), records will be reprocessed",
                    checkpoint,
                    self.group_id,
                    reason.as_str()
                );
                false
            }
            Err(source) => {
                counter!(COMMIT_FAILURES, "reason" => "fatal").increment(1);
                return Err(ProcessingError::Commit { checkpoint, source });
            }
        };

        Ok((records.len(), checkpoint, committed))
    }
}

/// Time since the record was produced, if the broker reported a timestamp.
/// Clock skew between producer and consumer hosts can make it negative: clamp to zero.
fn message_age(record: &Record, now: OffsetDateTime) -> Option<Duration> {
    let produced_ms = record.timestamp_ms?;
    let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
    Some(Duration::from_millis(
        now_ms.saturating_sub(produced_ms).max(0) as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::BatchAssembler;
    use common_kafka::FencingReason;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::sync::Mutex;

    struct ScriptedCommitter {
        result: Mutex<Option<CommitError>>,
        commits: Mutex<Vec<CommitCheckpoint>>,
    }

    impl ScriptedCommitter {
        fn ok() -> Self {
            Self::failing(None)
        }

        fn failing(error: Option<CommitError>) -> Self {
            Self {
                result: Mutex::new(error),
                commits: Mutex::new(Vec::new()),
            }
        }

        fn commits(&self) -> Vec<CommitCheckpoint> {
            self.commits.lock().unwrap().clone()
        }
    }

    impl OffsetCommitter for ScriptedCommitter {
        fn commit(&self, checkpoint: &CommitCheckpoint) -> Result<(), CommitError> {
            self.commits.lock().unwrap().push(checkpoint.clone());
            match self.result.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn record(partition: i32, offset: i64, payload: &[u8]) -> Record {
        Record {
            topic: "trades".to_owned(),
            partition,
            offset,
            key: Some(b"ACC1234".to_vec()),
            payload: Some(payload.to_vec()),
            timestamp_ms: Some(1_700_000_000_000),
        }
    }

    fn batch(records: Vec<Record>) -> Batch {
        let mut assembler = BatchAssembler::new(records.len(), Duration::from_secs(60));
        let now = Instant::now();
        let mut sealed = None;
        for record in records {
            sealed = assembler.push(record, now);
        }
        sealed.expect("batch should be full")
    }

    fn processor() -> BatchProcessor {
        BatchProcessor::new(
            SimulatedWorkHandler::new(Duration::from_millis(1)),
            Duration::from_secs(1),
            "batchers",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn commits_highest_offset_per_partition() {
        let committer = ScriptedCommitter::ok();
        let mut processor = processor();

        let report = processor
            .process(
                batch(vec![
                    record(0, 10, b"{\"a\":1}"),
                    record(1, 4, b"{\"a\":2}"),
                    record(0, 11, b"{\"a\":3}"),
                ]),
                &committer,
            )
            .await
            .unwrap();

        assert_eq!(report.records, 3);
        assert!(report.committed);
        assert!(report.duration >= Duration::from_secs(1));
        assert_eq!(processor.total_processed(), 3);

        let commits = committer.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].processed_offset("trades", 0), Some(11));
        assert_eq!(commits[0].processed_offset("trades", 1), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_record_aborts_batch_without_commit() {
        let committer = ScriptedCommitter::ok();
        let mut processor = processor();

        let error = processor
            .process(
                batch(vec![
                    record(0, 1, b"{}"),
                    record(0, 2, b"not json"),
                    record(0, 3, b"{}"),
                ]),
                &committer,
            )
            .await
            .unwrap_err();

        match error {
            ProcessingError::Record {
                partition, offset, ..
            } => {
                assert_eq!(partition, 0);
                assert_eq!(offset, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(committer.commits().is_empty());
        assert_eq!(processor.total_processed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_payload_is_a_record_error() {
        let committer = ScriptedCommitter::ok();
        let mut processor = processor();
        let mut tombstone = record(0, 1, b"");
        tombstone.payload = None;

        let error = processor
            .process(batch(vec![tombstone]), &committer)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ProcessingError::Record {
                source: RecordError::MissingPayload,
                ..
            }
        ));
        assert!(committer.commits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fenced_commits_are_not_errors() {
        for reason in [
            FencingReason::IllegalGeneration,
            FencingReason::AssignmentLost,
            FencingReason::NoOffsetRecorded,
        ] {
            let committer = ScriptedCommitter::failing(Some(CommitError::Fenced(reason)));
            let mut processor = processor();

            let report = processor
                .process(batch(vec![record(0, 7, b"{}")]), &committer)
                .await
                .unwrap();

            assert!(!report.committed);
            assert_eq!(report.records, 1);
            assert_eq!(committer.commits().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_commit_error_propagates() {
        let committer = ScriptedCommitter::failing(Some(CommitError::Fatal(
            KafkaError::ConsumerCommit(RDKafkaErrorCode::GroupAuthorizationFailed),
        )));
        let mut processor = processor();

        let error = processor
            .process(batch(vec![record(0, 7, b"{}"), record(2, 9, b"{}")]), &committer)
            .await
            .unwrap_err();

        let message = error.to_string();
        match error {
            ProcessingError::Commit {
                checkpoint,
                source: CommitError::Fatal(_),
            } => {
                assert_eq!(checkpoint.processed_offset("trades", 0), Some(7));
                assert_eq!(checkpoint.processed_offset("trades", 2), Some(9));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(message.contains("trades[0]@7"), "{}", message);
        assert!(message.contains("trades[2]@9"), "{}", message);
    }

    #[test]
    fn message_age_is_clamped() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_010).unwrap();
        let mut r = record(0, 0, b"{}");

        assert_eq!(message_age(&r, now), Some(Duration::from_secs(10)));

        r.timestamp_ms = Some(1_700_000_020_000);
        assert_eq!(message_age(&r, now), Some(Duration::ZERO));

        r.timestamp_ms = None;
        assert_eq!(message_age(&r, now), None);
    }
}
