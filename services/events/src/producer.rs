//! Kafka producer for video lifecycle events.
//!
//! The publisher is an owned value: whoever constructs it decides when it is
//! flushed and closed. Delivery is acknowledged by the partition leader only
//! (`acks=1`), so a success means the record was appended once, not that it
//! was replicated.

use crate::config::KafkaConfig;
use crate::event::DomainEvent;
use base64::{engine::general_purpose::STANDARD, Engine};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    /// Broker unreachable or the request timed out
    #[error("Failed to send message to topic {topic}: {message}")]
    Transport { topic: String, message: String },

    /// Broker refused the record; resending the same bytes will not help
    #[error("Message rejected by topic {topic}: {message}")]
    Rejected { topic: String, message: String },

    #[error("Producer flush timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    /// Whether the caller may re-invoke the publish. A retry can produce a
    /// duplicate downstream since the publish layer is not idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublishError::Transport { .. } | PublishError::Timeout(_)
        )
    }

    fn from_kafka(topic: &str, error: KafkaError) -> Self {
        let rejected = matches!(
            error.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::MessageSizeTooLarge
                    | RDKafkaErrorCode::InvalidMessage
                    | RDKafkaErrorCode::TopicAuthorizationFailed
            )
        );

        if rejected {
            PublishError::Rejected {
                topic: topic.to_string(),
                message: error.to_string(),
            }
        } else {
            PublishError::Transport {
                topic: topic.to_string(),
                message: error.to_string(),
            }
        }
    }
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, PublishError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| PublishError::SerializationError(e.to_string()))?;
        Ok(Self::new(topic, payload))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Where a failed message originally came from
#[derive(Debug, Clone)]
pub struct DeadLetterSource<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub payload: &'a [u8],
}

/// Anything that can append messages to the event channel.
///
/// The catalog service and the worker depend on this seam rather than on
/// the concrete producer.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Send one message and wait for the broker acknowledgement
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, PublishError>;

    /// Topic used for dead letters
    fn dead_letter_topic(&self) -> &str;

    /// Topic used for video lifecycle events
    fn video_events_topic(&self) -> &str;

    /// Append an already-serialized payload to `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<DeliveryResult, PublishError> {
        self.send(OutgoingMessage::new(topic, payload)).await
    }

    /// Publish a domain event keyed by its video id, so every event for one
    /// video lands on the same partition
    async fn publish_event(&self, event: &DomainEvent) -> Result<DeliveryResult, PublishError> {
        let payload = event
            .encode()
            .map_err(|e| PublishError::SerializationError(e.to_string()))?;
        let message = OutgoingMessage::new(self.video_events_topic(), payload)
            .with_key(&event.video_id)
            .with_message_type(event.event_type.to_string())
            .with_correlation_id(&event.video_id);

        self.send(message).await
    }

    /// Send a message the consumer gave up on to the dead letter topic
    async fn send_to_dlq(
        &self,
        source: DeadLetterSource<'_>,
        reason: &str,
    ) -> Result<DeliveryResult, PublishError> {
        let dlq_message = serde_json::json!({
            "original_topic": source.topic,
            "original_partition": source.partition,
            "original_offset": source.offset,
            "original_message_base64": STANDARD.encode(source.payload),
            "error": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let message = OutgoingMessage::new_json(self.dead_letter_topic(), &dlq_message)?
            .with_key(format!("{}-{}-{}", source.topic, source.partition, source.offset))
            .with_message_type("dead_letter")
            .with_header("original-topic", source.topic)
            .with_header("error-reason", reason);

        self.send(message).await
    }
}

/// Kafka-backed event publisher
pub struct EventPublisher {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    delivery_timeout: Duration,
}

impl EventPublisher {
    /// Create a new publisher with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, PublishError> {
        info!(
            brokers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| PublishError::CreationError(e.to_string()))?;

        let delivery_timeout = config.delivery_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            delivery_timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Flush pending messages and release the producer
    pub fn close(self, timeout: Duration) -> Result<(), PublishError> {
        info!("Closing Kafka producer");
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| PublishError::Timeout(timeout))
    }
}

#[async_trait::async_trait]
impl EventSink for EventPublisher {
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, PublishError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| {
                let err = PublishError::from_kafka(&message.topic, e);
                warn!(error = %err, retryable = err.is_retryable(), "Publish failed");
                err
            })?;

        info!(
            topic = %message.topic,
            partition,
            offset,
            "Produced message"
        );

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
            key: message.key,
        })
    }

    fn dead_letter_topic(&self) -> &str {
        &self.config.topics.dead_letter_queue
    }

    fn video_events_topic(&self) -> &str {
        &self.config.topics.video_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, PublishError> {
            let mut sent = self.sent.lock().unwrap();
            let result = DeliveryResult {
                topic: message.topic.clone(),
                partition: 0,
                offset: sent.len() as i64,
                key: message.key.clone(),
            };
            sent.push(message);
            Ok(result)
        }

        fn dead_letter_topic(&self) -> &str {
            "video-events.dlq"
        }

        fn video_events_topic(&self) -> &str {
            "video-events"
        }
    }

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new("test", vec![1, 2, 3])
            .with_key("my-key")
            .with_header("header1", "value1")
            .with_correlation_id("corr-123");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let err = PublishError::Transport {
            topic: "video-events".to_string(),
            message: "broker down".to_string(),
        };
        assert!(err.is_retryable());
        assert!(PublishError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!PublishError::SerializationError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_kafka_error_classification() {
        let rejected = PublishError::from_kafka(
            "video-events",
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge),
        );
        assert!(!rejected.is_retryable());

        let transport = PublishError::from_kafka(
            "video-events",
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
        );
        assert!(transport.is_retryable());
    }

    #[tokio::test]
    async fn test_publish_event_is_keyed_by_video_id() {
        let sink = RecordingSink::default();
        let result = sink
            .publish_event(&DomainEvent::video_created("vid-1"))
            .await
            .unwrap();

        assert_eq!(result.topic, "video-events");
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].key.as_deref(), Some("vid-1"));
        assert!(sent[0]
            .headers
            .contains(&("message-type".to_string(), "VIDEO_CREATED".to_string())));
        assert_eq!(
            DomainEvent::decode(&sent[0].payload).unwrap(),
            DomainEvent::video_created("vid-1")
        );
    }

    #[tokio::test]
    async fn test_send_to_dlq_wraps_original_payload() {
        let sink = RecordingSink::default();
        sink.send_to_dlq(
            DeadLetterSource {
                topic: "video-events",
                partition: 2,
                offset: 41,
                payload: b"payload",
            },
            "conversion failed",
        )
        .await
        .unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].topic, "video-events.dlq");
        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["original_offset"], 41);
        assert_eq!(body["original_message_base64"], STANDARD.encode(b"payload"));
        assert_eq!(body["error"], "conversion failed");
    }
}
