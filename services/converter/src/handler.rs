use crate::config::{FailurePolicy, WorkerConfig};
use crate::converter::{ConversionTrigger, TriggerError};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reel_events::{
    DeadLetterSource, Disposition, DomainEvent, EventSink, HandlerError, IncomingMessage,
    MessageHandler,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Handles video lifecycle events for the conversion worker.
///
/// Every outcome except a failed dead letter publish leads to a commit:
/// poison payloads and foreign event types are skipped, conversion failures
/// go through the configured [`FailurePolicy`].
pub struct VideoEventHandler {
    trigger: Arc<dyn ConversionTrigger>,
    sink: Arc<dyn EventSink>,
    config: WorkerConfig,
}

impl VideoEventHandler {
    pub fn new(
        trigger: Arc<dyn ConversionTrigger>,
        sink: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            trigger,
            sink,
            config,
        }
    }

    /// Invoke the trigger, retrying transient failures with exponential backoff
    async fn trigger_with_retry(&self, video_id: &str) -> Result<(), TriggerError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.trigger_initial_backoff(),
            max_interval: self.config.trigger_max_backoff(),
            max_elapsed_time: Some(self.config.trigger_max_elapsed()),
            ..Default::default()
        };
        let mut attempt = 1u32;

        loop {
            let err = match self.trigger.trigger(video_id).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.config.trigger_max_attempts {
                return Err(err);
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(err);
            };

            warn!(
                video_id = %video_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Conversion trigger failed, retrying"
            );
            metrics::counter!("converter.trigger.retries").increment(1);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn apply_failure_policy(
        &self,
        message: &IncomingMessage,
        video_id: &str,
        failure: TriggerError,
    ) -> Result<Disposition, HandlerError> {
        let reason = failure.to_string();

        match self.config.failure_policy {
            FailurePolicy::DeadLetter => {
                let source = DeadLetterSource {
                    topic: &message.metadata.topic,
                    partition: message.metadata.partition,
                    offset: message.metadata.offset,
                    payload: &message.payload,
                };

                let delivery = self.sink.send_to_dlq(source, &reason).await.map_err(|e| {
                    error!(
                        video_id = %video_id,
                        error = %e,
                        "Dead letter publish failed, leaving offset uncommitted"
                    );
                    HandlerError::Fatal(format!(
                        "could not dead-letter video {}: {}",
                        video_id, e
                    ))
                })?;

                warn!(
                    video_id = %video_id,
                    error = %reason,
                    dlq_topic = %delivery.topic,
                    dlq_offset = delivery.offset,
                    "Conversion failed, event sent to dead letter topic"
                );
                metrics::counter!("converter.messages.dead_lettered").increment(1);
                Ok(Disposition::DeadLettered { reason })
            }
            FailurePolicy::Drop => {
                error!(
                    video_id = %video_id,
                    error = %reason,
                    "Conversion failed, dropping event"
                );
                metrics::counter!("converter.messages.dropped").increment(1);
                Ok(Disposition::Dropped { reason })
            }
        }
    }
}

#[async_trait]
impl MessageHandler for VideoEventHandler {
    #[instrument(
        skip(self, message),
        fields(video_id = tracing::field::Empty, correlation_id = ?message.correlation_id())
    )]
    async fn handle(&self, message: &IncomingMessage) -> Result<Disposition, HandlerError> {
        let event = match DomainEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    size_bytes = message.payload.len(),
                    "Failed to decode event, skipping"
                );
                metrics::counter!("converter.messages.poison").increment(1);
                return Ok(Disposition::Poison {
                    reason: e.to_string(),
                });
            }
        };

        tracing::Span::current().record("video_id", event.video_id.as_str());

        if !event.is_video_created() {
            info!(event_type = %event.event_type, "Ignoring event");
            metrics::counter!("converter.messages.ignored").increment(1);
            return Ok(Disposition::Ignored {
                reason: format!("event type {}", event.event_type),
            });
        }

        match self.trigger_with_retry(&event.video_id).await {
            Ok(()) => {
                debug!("Conversion triggered");
                metrics::counter!("converter.messages.converted").increment(1);
                Ok(Disposition::Handled)
            }
            Err(e) => self.apply_failure_policy(message, &event.video_id, e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MockConversionTrigger;
    use reel_events::{DeliveryResult, MessageMetadata, OutgoingMessage, PublishError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutgoingMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, PublishError> {
            if self.fail {
                return Err(PublishError::Transport {
                    topic: message.topic,
                    message: "broker unreachable".to_string(),
                });
            }
            let result = DeliveryResult {
                topic: message.topic.clone(),
                partition: 0,
                offset: 7,
                key: message.key.clone(),
            };
            self.sent.lock().unwrap().push(message);
            Ok(result)
        }

        fn dead_letter_topic(&self) -> &str {
            "video-events.dlq"
        }

        fn video_events_topic(&self) -> &str {
            "video-events"
        }
    }

    fn message(payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "video-events".to_string(),
                partition: 0,
                offset: 12,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
        }
    }

    fn fast_retries(policy: FailurePolicy) -> WorkerConfig {
        WorkerConfig {
            failure_policy: policy,
            trigger_initial_backoff_ms: 1,
            trigger_max_backoff_ms: 2,
            trigger_max_elapsed_ms: 5_000,
            trigger_max_attempts: 3,
        }
    }

    fn transient(video_id: &str) -> TriggerError {
        TriggerError::Transient {
            video_id: video_id.to_string(),
            message: "converter busy".to_string(),
        }
    }

    const CREATED: &[u8] = br#"{"eventType":"VIDEO_CREATED","videoID":"64f1ab"}"#;

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut trigger = MockConversionTrigger::new();
        let mut seq = mockall::Sequence::new();
        trigger
            .expect_trigger()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Err(transient(id)));
        trigger
            .expect_trigger()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let sink = Arc::new(RecordingSink::default());
        let handler = VideoEventHandler::new(
            Arc::new(trigger),
            sink.clone(),
            fast_retries(FailurePolicy::DeadLetter),
        );

        let disposition = handler.handle(&message(CREATED)).await.unwrap();
        assert_eq!(disposition, Disposition::Handled);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter_topic() {
        let mut trigger = MockConversionTrigger::new();
        trigger
            .expect_trigger()
            .times(3)
            .returning(|id| Err(transient(id)));

        let sink = Arc::new(RecordingSink::default());
        let handler = VideoEventHandler::new(
            Arc::new(trigger),
            sink.clone(),
            fast_retries(FailurePolicy::DeadLetter),
        );

        let disposition = handler.handle(&message(CREATED)).await.unwrap();
        assert!(matches!(disposition, Disposition::DeadLettered { .. }));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "video-events.dlq");
        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["original_offset"], 12);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut trigger = MockConversionTrigger::new();
        trigger.expect_trigger().times(1).returning(|id| {
            Err(TriggerError::Permanent {
                video_id: id.to_string(),
                message: "unsupported codec".to_string(),
            })
        });

        let handler = VideoEventHandler::new(
            Arc::new(trigger),
            Arc::new(RecordingSink::default()),
            fast_retries(FailurePolicy::Drop),
        );

        let disposition = handler.handle(&message(CREATED)).await.unwrap();
        assert!(matches!(disposition, Disposition::Dropped { .. }));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_fatal() {
        let mut trigger = MockConversionTrigger::new();
        trigger
            .expect_trigger()
            .returning(|id| Err(transient(id)));

        let handler = VideoEventHandler::new(
            Arc::new(trigger),
            Arc::new(RecordingSink {
                fail: true,
                ..Default::default()
            }),
            fast_retries(FailurePolicy::DeadLetter),
        );

        let result = handler.handle(&message(CREATED)).await;
        assert!(matches!(result, Err(HandlerError::Fatal(_))));
    }
}
