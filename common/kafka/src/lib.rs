pub mod config;
pub mod context;
pub mod credentials;
pub mod producer;
pub mod retry;
pub mod transport;

pub use config::{AuthMode, ConsumerConfig, EnvSecsDuration, KafkaConfig, ProducerConfig};
pub use context::KafkaClientContext;
pub use credentials::{token_cache_for, CredentialError, CredentialToken, TokenCache, TokenProvider};
pub use transport::{
    CommitCheckpoint, CommitError, FencingReason, KafkaTransport, OffsetCommitter, PollOutcome,
    Record, RecordSource, TransportError,
};
