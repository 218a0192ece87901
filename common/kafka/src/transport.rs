use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::context::KafkaClientContext;
use crate::credentials::TokenCache;

/// A record read from the stream, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Produce (or log append) time, milliseconds since the unix epoch
    pub timestamp_ms: Option<i64>,
}

impl Record {
    fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        }
    }
}

/// Result of one bounded poll. Only real failures are errors: reaching the end
/// of a partition and an empty poll are normal outcomes.
#[derive(Debug)]
pub enum PollOutcome {
    Record(Record),
    EndOfPartition { partition: Option<i32> },
    Empty,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to create or subscribe the consumer: {0}")]
    Setup(#[source] KafkaError),
    #[error("broker rejected authentication after a token refresh: {0}")]
    Authentication(#[source] KafkaError),
    #[error("kafka consumer error: {0}")]
    Kafka(#[from] KafkaError),
}

impl TransportError {
    /// Connection level errors: the client reconnects on its own, the caller
    /// logs and polls again. Everything else stops the consumer.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Kafka(
                KafkaError::MessageConsumption(code) | KafkaError::Global(code),
            ) => is_connection_error(*code),
            _ => false,
        }
    }
}

fn is_connection_error(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RequestTimedOut
    )
}

/// Group membership changed under an in-flight commit. The partition now belongs
/// to another member, which resumes from the last committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencingReason {
    IllegalGeneration,
    AssignmentLost,
    NoOffsetRecorded,
}

impl FencingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FencingReason::IllegalGeneration => "illegal_generation",
            FencingReason::AssignmentLost => "assignment_lost",
            FencingReason::NoOffsetRecorded => "no_offset",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("commit fenced by group rebalance ({})", .0.as_str())]
    Fenced(FencingReason),
    #[error("commit failed: {0}")]
    Fatal(#[source] KafkaError),
}

impl From<KafkaError> for CommitError {
    fn from(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::IllegalGeneration) => {
                CommitError::Fenced(FencingReason::IllegalGeneration)
            }
            Some(RDKafkaErrorCode::AssignmentLost) => {
                CommitError::Fenced(FencingReason::AssignmentLost)
            }
            Some(RDKafkaErrorCode::NoOffset) => CommitError::Fenced(FencingReason::NoOffsetRecorded),
            _ => CommitError::Fatal(error),
        }
    }
}

/// Highest processed offset per (topic, partition) of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitCheckpoint {
    offsets: BTreeMap<(String, i32), i64>,
}

impl CommitCheckpoint {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut checkpoint = Self::default();
        for record in records {
            checkpoint.observe(&record.topic, record.partition, record.offset);
        }
        checkpoint
    }

    pub fn observe(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self
            .offsets
            .entry((topic.to_owned(), partition))
            .or_insert(offset);
        *entry = (*entry).max(offset);
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn processed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets.get(&(topic.to_owned(), partition)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32, i64)> {
        self.offsets
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, *offset))
    }

    /// Kafka commits name the next offset to consume, one past the last processed.
    pub fn to_topic_partition_list(&self) -> Result<TopicPartitionList, KafkaError> {
        let mut list = TopicPartitionList::with_capacity(self.offsets.len());
        for (topic, partition, offset) in self.iter() {
            list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        }
        Ok(list)
    }
}

impl std::fmt::Display for CommitCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(topic, partition, offset)| format!("{}[{}]@{}", topic, partition, offset))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Wait at most `timeout` for the next record.
    async fn poll(&self, timeout: Duration) -> Result<PollOutcome, TransportError>;

    /// Best effort release of the group membership on shutdown.
    async fn close(&self) {}
}

pub trait OffsetCommitter: Send + Sync {
    fn commit(&self, checkpoint: &CommitCheckpoint) -> Result<(), CommitError>;
}

/// Consumer side of the Kafka transport: one topic, one consumer group,
/// manual offset commits.
pub struct KafkaTransport {
    consumer: StreamConsumer<KafkaClientContext>,
    topic: String,
    group_id: String,
    commit_mode: CommitMode,
    tokens: Option<Arc<TokenCache>>,
}

impl KafkaTransport {
    pub fn new(
        kafka: &KafkaConfig,
        config: &ConsumerConfig,
        context: KafkaClientContext,
    ) -> Result<Self, TransportError> {
        info!(
            "subscribing to {} as group {} via {}",
            config.topic, config.group_id, kafka.bootstrap_servers
        );

        let mut client_config = kafka.client_config();
        config.apply(&mut client_config);

        let tokens = context.tokens();
        let consumer: StreamConsumer<KafkaClientContext> = client_config
            .create_with_context(context)
            .map_err(TransportError::Setup)?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(TransportError::Setup)?;

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            commit_mode: config.commit_mode.into(),
            tokens,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn committed(&self, timeout: Duration) -> Result<TopicPartitionList, KafkaError> {
        self.consumer.committed(timeout)
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Record>, KafkaError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(Record::from_borrowed(&message))),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }

    fn outcome(result: Result<Option<Record>, KafkaError>) -> Result<PollOutcome, TransportError> {
        match result {
            Ok(Some(record)) => Ok(PollOutcome::Record(record)),
            Ok(None) => Ok(PollOutcome::Empty),
            Err(KafkaError::PartitionEOF(partition)) => Ok(PollOutcome::EndOfPartition {
                partition: Some(partition),
            }),
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::PartitionEOF) => {
                Ok(PollOutcome::EndOfPartition { partition: None })
            }
            Err(e) => Err(TransportError::Kafka(e)),
        }
    }
}

fn is_authentication_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Authentication) | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
    )
}

/// Receive once; on an authentication rejection call `invalidate` so the next
/// handshake signs a fresh token, and receive one more time. A second
/// rejection is final.
async fn receive_reauthenticating<R, Fut, I>(
    mut receive: R,
    invalidate: I,
) -> Result<PollOutcome, TransportError>
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Record>, KafkaError>>,
    I: FnOnce(),
{
    match receive().await {
        Err(e) if is_authentication_error(&e) => {
            warn!("authentication rejected, refreshing token: {}", e);
            invalidate();
            match receive().await {
                Err(e) if is_authentication_error(&e) => Err(TransportError::Authentication(e)),
                retried => KafkaTransport::outcome(retried),
            }
        }
        result => KafkaTransport::outcome(result),
    }
}

#[async_trait]
impl RecordSource for KafkaTransport {
    async fn poll(&self, timeout: Duration) -> Result<PollOutcome, TransportError> {
        let result = receive_reauthenticating(
            || self.recv(timeout),
            || {
                if let Some(tokens) = &self.tokens {
                    tokens.invalidate();
                }
            },
        )
        .await;
        if let Err(TransportError::Authentication(e)) = &result {
            warn!(
                "group {} on {} still rejected after token refresh: {}",
                self.group_id, self.topic, e
            );
        }
        result
    }

    async fn close(&self) {
        info!("leaving consumer group {}", self.group_id);
        self.consumer.unsubscribe();
    }
}

impl OffsetCommitter for KafkaTransport {
    fn commit(&self, checkpoint: &CommitCheckpoint) -> Result<(), CommitError> {
        if checkpoint.is_empty() {
            return Ok(());
        }
        let list = checkpoint
            .to_topic_partition_list()
            .map_err(CommitError::Fatal)?;
        self.consumer
            .commit(&list, self.commit_mode)
            .map_err(CommitError::from)
    }
}
