//! Reel Events - Kafka event channel for the video catalog
//!
//! Shared by both Reel services:
//!
//! - The catalog service publishes a `VIDEO_CREATED` event after each
//!   successful upload ([`EventPublisher`], [`EventSink`])
//! - The conversion worker consumes those events as a consumer-group member
//!   ([`EventConsumer`], [`MessageHandler`])
//!
//! Delivery is at-least-once. Offsets are committed per message, after the
//! handler returns, never before.
//!
//! # Example
//!
//! ```rust,no_run
//! use reel_events::{DomainEvent, EventPublisher, EventSink, KafkaConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let publisher = EventPublisher::new(config)?;
//!
//!     let delivery = publisher
//!         .publish_event(&DomainEvent::video_created("64f1ab"))
//!         .await?;
//!     println!("partition={} offset={}", delivery.partition, delivery.offset);
//!
//!     publisher.close(std::time::Duration::from_secs(5))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod producer;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, TopicConfig, CONVERTER_GROUP,
    VIDEO_EVENTS_TOPIC,
};
pub use consumer::{
    consume_stream, escalate_fatal_errors, is_fatal_error, ConsumerError, Dispatcher,
    Disposition, ErrorReceiver, EventConsumer, HandlerError, IncomingMessage, LoopSettings,
    MessageHandler, MessageMetadata, OffsetCommitter, OffsetTracker, ReelContext,
    ShutdownHandle, StopReason,
};
pub use event::{DomainEvent, EventError, EventType, VIDEO_CREATED};
pub use producer::{
    DeadLetterSource, DeliveryResult, EventPublisher, EventSink, OutgoingMessage, PublishError,
};

/// Async trait for handlers and sinks (re-export for convenience)
pub use async_trait::async_trait;
