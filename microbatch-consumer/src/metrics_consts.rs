pub const MESSAGES_PROCESSED: &str = "kafka_messages_processed_total";
pub const MESSAGES_PER_SECOND: &str = "kafka_messages_per_second";
pub const BATCH_PROCESSING_SECONDS: &str = "kafka_batch_processing_seconds";
pub const MESSAGE_AGE_SECONDS: &str = "kafka_message_age_seconds";
pub const BATCH_SIZE: &str = "kafka_batch_size";
pub const COMMIT_FAILURES: &str = "kafka_commit_failures_total";
pub const POLL_EVENTS: &str = "kafka_consumer_poll_events_total";
pub const BATCHES_ABANDONED: &str = "kafka_batches_abandoned_total";
