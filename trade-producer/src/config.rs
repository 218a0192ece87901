use common_kafka::{KafkaConfig, ProducerConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8001")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub producer: ProducerConfig,

    #[envconfig(from = "KAFKA_TOPIC", default = "demo-topic")]
    pub topic: String,

    // 0 pauses the producer
    #[envconfig(from = "MESSAGES_PER_SECOND", default = "100")]
    pub messages_per_second: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
