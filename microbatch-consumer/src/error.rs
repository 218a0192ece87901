use common_kafka::{CommitCheckpoint, CommitError, TransportError};
use thiserror::Error;

/// Invalid values that envconfig parsing alone cannot reject.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("BATCH_SIZE must be greater than 0")]
    ZeroBatchSize,
    #[error("POLL_TIMEOUT_SECONDS must be greater than 0")]
    ZeroPollTimeout,
}

/// Failure to handle a single record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record has no payload")]
    MissingPayload,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A batch that could not be processed. Offsets of the batch were not committed.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("failed to process record {topic}[{partition}]@{offset}: {source}")]
    Record {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: RecordError,
    },
    #[error("failed to commit {checkpoint}: {source}")]
    Commit {
        checkpoint: CommitCheckpoint,
        #[source]
        source: CommitError,
    },
}

/// Errors that stop the consumer loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("batch processing failed: {0}")]
    Processing(#[from] ProcessingError),
}
