use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::consumer::CommitMode;
use rdkafka::ClientConfig;

/// Connection settings shared by the consumer and the producer.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS")]
    pub bootstrap_servers: String,

    #[envconfig(from = "KAFKA_AUTH_MODE", default = "msk-iam")]
    pub auth_mode: AuthMode,

    #[envconfig(from = "AWS_REGION", default = "us-east-1")]
    pub aws_region: String,

    // Cached tokens with less remaining lifetime than this are regenerated
    #[envconfig(from = "TOKEN_MIN_LIFETIME_SECONDS", default = "300")]
    pub token_min_lifetime: EnvSecsDuration,
}

impl KafkaConfig {
    /// Base rdkafka configuration: bootstrap servers and transport security.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("statistics.interval.ms", "10000");

        match self.auth_mode {
            AuthMode::MskIam => {
                client_config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanism", "OAUTHBEARER");
            }
            AuthMode::Tls => {
                client_config.set("security.protocol", "ssl");
            }
            AuthMode::Plaintext => {}
        };

        client_config
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(from = "KAFKA_TOPIC")]
    pub topic: String,

    #[envconfig(from = "CONSUMER_GROUP")]
    pub group_id: String,

    // A new group starts from the tail: replaying a demo backlog is rarely wanted
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "latest")]
    pub offset_reset: OffsetReset,

    #[envconfig(from = "KAFKA_CONSUMER_COMMIT_MODE", default = "sync")]
    pub commit_mode: OffsetCommitMode,

    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "10000")]
    pub session_timeout_ms: u32,

    #[envconfig(from = "KAFKA_HEARTBEAT_INTERVAL_MS", default = "1000")]
    pub heartbeat_interval_ms: u32,

    #[envconfig(from = "KAFKA_MAX_POLL_INTERVAL_MS", default = "300000")]
    pub max_poll_interval_ms: u32,

    #[envconfig(from = "KAFKA_FETCH_WAIT_MAX_MS", default = "10")]
    pub fetch_wait_max_ms: u32,

    #[envconfig(from = "KAFKA_MAX_PARTITION_FETCH_BYTES", default = "131072")]
    pub max_partition_fetch_bytes: u32,

    #[envconfig(
        from = "KAFKA_PARTITION_ASSIGNMENT_STRATEGY",
        default = "cooperative-sticky"
    )]
    pub partition_assignment_strategy: String,

    #[envconfig(from = "KAFKA_ENABLE_PARTITION_EOF", default = "false")]
    pub enable_partition_eof: bool,
}

impl ConsumerConfig {
    /// Group consumer settings on top of the connection settings. Offsets are
    /// never stored or committed automatically: commits follow processing.
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "partition.assignment.strategy",
                &self.partition_assignment_strategy,
            )
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                self.heartbeat_interval_ms.to_string(),
            )
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string())
            .set("fetch.min.bytes", "1")
            .set("fetch.wait.max.ms", self.fetch_wait_max_ms.to_string())
            .set(
                "max.partition.fetch.bytes",
                self.max_partition_fetch_bytes.to_string(),
            )
            .set("connections.max.idle.ms", "540000")
            .set("reconnect.backoff.ms", "50")
            .set(
                "enable.partition.eof",
                self.enable_partition_eof.to_string(),
            );
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    #[envconfig(from = "KAFKA_PRODUCER_LINGER_MS", default = "5")]
    pub linger_ms: u32, // Wait this long to fill a batch during low traffic

    #[envconfig(from = "KAFKA_PRODUCER_BATCH_SIZE", default = "32768")]
    pub batch_size: u32, // Bytes per partition batch

    #[envconfig(from = "KAFKA_PRODUCER_QUEUE_MIB", default = "64")]
    pub queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(from = "KAFKA_MAX_IN_FLIGHT", default = "10")]
    pub max_in_flight: u32, // Pipelined requests per broker connection

    #[envconfig(from = "KAFKA_ACKS", default = "1")]
    pub acks: String, // Leader acknowledgement only

    #[envconfig(from = "KAFKA_COMPRESSION_CODEC", default = "gzip")]
    pub compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "20000")]
    pub message_timeout_ms: u32, // Time before we stop retrying to deliver a message
}

impl ProducerConfig {
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("linger.ms", self.linger_ms.to_string())
            .set("batch.size", self.batch_size.to_string())
            .set(
                "queue.buffering.max.kbytes",
                (self.queue_mib * 1024).to_string(),
            )
            .set(
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            )
            .set("acks", &self.acks)
            .set("compression.codec", &self.compression_codec)
            .set("message.timeout.ms", self.message_timeout_ms.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// SASL_SSL with OAUTHBEARER tokens signed for Amazon MSK IAM
    MskIam,
    Tls,
    Plaintext,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAuthModeError(String);

impl FromStr for AuthMode {
    type Err = ParseAuthModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "msk-iam" | "msk_iam" | "iam" => Ok(AuthMode::MskIam),
            "tls" | "ssl" => Ok(AuthMode::Tls),
            "plaintext" | "none" => Ok(AuthMode::Plaintext),
            other => Err(ParseAuthModeError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOffsetResetError;

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            _ => Err(ParseOffsetResetError),
        }
    }
}

/// How the consumer commits a processed batch. `Sync` returns once the
/// coordinator acknowledged the commit; `Async` enqueues it and reports the
/// result through the client context, widening the replay window after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetCommitMode {
    Sync,
    Async,
}

impl From<OffsetCommitMode> for CommitMode {
    fn from(mode: OffsetCommitMode) -> Self {
        match mode {
            OffsetCommitMode::Sync => CommitMode::Sync,
            OffsetCommitMode::Async => CommitMode::Async,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCommitModeError;

impl FromStr for OffsetCommitMode {
    type Err = ParseCommitModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(OffsetCommitMode::Sync),
            "async" => Ok(OffsetCommitMode::Async),
            _ => Err(ParseCommitModeError),
        }
    }
}

/// A duration read from the environment as (fractional) seconds, e.g. `0.01`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvSecsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s
            .trim()
            .parse::<f64>()
            .map_err(|_| ParseEnvSecsDurationError)?;

        if !secs.is_finite() || secs < 0.0 {
            return Err(ParseEnvSecsDurationError);
        }

        Ok(EnvSecsDuration(Duration::from_secs_f64(secs)))
    }
}
