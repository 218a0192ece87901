use common_kafka::{ConsumerConfig, EnvSecsDuration, KafkaConfig};
use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // A batch is sealed as soon as it holds this many records
    #[envconfig(from = "BATCH_SIZE", default = "10")]
    pub batch_size: usize,

    // ... or once its first record is this old
    #[envconfig(from = "BATCH_TIMEOUT_SECONDS", default = "0.01")]
    pub batch_timeout: EnvSecsDuration,

    // Simulated work per sealed batch
    #[envconfig(from = "BATCH_PROCESSING_TIME", default = "1")]
    pub batch_processing_time: EnvSecsDuration,

    // Simulated work per record
    #[envconfig(from = "MESSAGE_PROCESSING_TIME", default = "0.0001")]
    pub message_processing_time: EnvSecsDuration,

    #[envconfig(from = "POLL_TIMEOUT_SECONDS", default = "1")]
    pub poll_timeout: EnvSecsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.poll_timeout.0.is_zero() {
            return Err(ConfigError::ZeroPollTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::AuthMode;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("KAFKA_BOOTSTRAP_SERVERS".to_string(), "localhost:9092".to_string()),
            ("KAFKA_TOPIC".to_string(), "trades".to_string()),
            ("CONSUMER_GROUP".to_string(), "batchers".to_string()),
        ]);
        for (key, value) in extra {
            env.insert(key.to_string(), value.to_string());
        }
        env
    }

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&env(&[])).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:8000");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_timeout.0, Duration::from_millis(10));
        assert_eq!(config.batch_processing_time.0, Duration::from_secs(1));
        assert_eq!(config.message_processing_time.0, Duration::from_micros(100));
        assert_eq!(config.poll_timeout.0, Duration::from_secs(1));
        assert_eq!(config.kafka.auth_mode, AuthMode::MskIam);
        assert_eq!(config.consumer.group_id, "batchers");
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn required_values_are_enforced() {
        let mut env = env(&[]);
        env.remove("CONSUMER_GROUP");
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::init_from_hashmap(&env(&[("BATCH_SIZE", "-1")])).is_err());
        assert!(Config::init_from_hashmap(&env(&[("BATCH_TIMEOUT_SECONDS", "-0.5")])).is_err());
        assert!(Config::init_from_hashmap(&env(&[("KAFKA_AUTH_MODE", "kerberos")])).is_err());

        let config = Config::init_from_hashmap(&env(&[("BATCH_SIZE", "0")])).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));

        let config = Config::init_from_hashmap(&env(&[("POLL_TIMEOUT_SECONDS", "0")])).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::ZeroPollTimeout));
    }
}
