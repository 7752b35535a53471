use crate::domain::events::EventEnvelope;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event envelope: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("kafka producer error: {0}")]
    Producer(#[from] KafkaError),
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Keyed, at-least-once publish channel for outbox events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `envelope` on the logical `topic`, keyed by `key` so that
    /// events for one aggregate stay on one partition.
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope)
        -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub producer_acks: String,
    pub enable_idempotence: bool,
    pub message_timeout_ms: u64,
    pub security_protocol: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "chat-consistency".to_string(),
            topic_prefix: "chat".to_string(),
            producer_acks: "all".to_string(),
            enable_idempotence: true,
            message_timeout_ms: 10_000,
            security_protocol: "PLAINTEXT".to_string(),
        }
    }
}

impl KafkaConfig {
    pub fn topic_name(&self, logical_topic: &str) -> String {
        if self.topic_prefix.is_empty() {
            logical_topic.to_string()
        } else {
            format!("{}.{}", self.topic_prefix, logical_topic)
        }
    }
}

#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaEventPublisher {
    pub fn new(config: KafkaConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", &config.producer_acks)
            .set("enable.idempotence", config.enable_idempotence.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("security.protocol", &config.security_protocol)
            .create()?;
        Ok(Self { producer, config })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        let topic = self.config.topic_name(topic);
        let payload = serde_json::to_vec(envelope)?;
        let version = envelope.version.to_string();
        let event_id = envelope.event_id.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event-type",
                value: Some(envelope.event_type.as_str()),
            })
            .insert(Header {
                key: "event-version",
                value: Some(version.as_str()),
            })
            .insert(Header {
                key: "event-id",
                value: Some(event_id.as_str()),
            });

        let record = FutureRecord::to(&topic)
            .key(key)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(
                record,
                Timeout::After(Duration::from_millis(self.config.message_timeout_ms)),
            )
            .await
            .map_err(|(e, _)| PublishError::Producer(e))?;

        debug!(
            topic = %topic,
            key,
            partition,
            offset,
            event_type = %envelope.event_type,
            "Published event"
        );
        Ok(())
    }
}
