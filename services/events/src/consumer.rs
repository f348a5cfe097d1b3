//! Consumer-group side of the event channel.
//!
//! Offsets are committed by hand, one message at a time, and only after the
//! handler for that message has returned. A handler that returns an error
//! leaves the offset uncommitted and stops the consumer, so the message is
//! redelivered to whichever group member owns the partition next.

use crate::config::KafkaConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    /// Unrecoverable broker condition; the process should exit
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    #[error("Message handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// Error returned by a handler that could not finish a message.
///
/// Returning one of these means the offset is not committed.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Fatal(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Convert a broker message into an owned message
    pub fn from_kafka<M: KafkaMessage>(msg: &M) -> Self {
        let payload = msg.payload().unwrap_or(&[]).to_vec();
        let key = msg.key().map(|k| k.to_vec());

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }

    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header("correlation-id")
    }
}

/// What a handler did with a message. Every variant leads to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Side-effecting work completed
    Handled,
    /// Deliberately filtered out; no side effects
    Ignored { reason: String },
    /// Payload could not be decoded
    Poison { reason: String },
    /// Work failed and the message was parked on the dead letter topic
    DeadLettered { reason: String },
    /// Work failed and the configured policy drops it
    Dropped { reason: String },
    /// Offset already handled by this process; handler not invoked
    Duplicate,
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<Disposition, HandlerError>;
}

/// Marks a message as consumed for the group
pub trait OffsetCommitter: Send + Sync {
    fn commit(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError>;
}

impl<C: ConsumerContext + 'static> OffsetCommitter for StreamConsumer<C> {
    fn commit(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &metadata.topic,
            metadata.partition,
            Offset::Offset(metadata.offset + 1),
        )
        .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        Consumer::commit(self, &tpl, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

/// Highest offset handled per partition by this process
#[derive(Debug, Default)]
pub struct OffsetTracker {
    handled: Mutex<HashMap<(String, i32), i64>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this offset (or a later one) on the same partition was
    /// already handled and committed
    pub fn is_redelivery(&self, metadata: &MessageMetadata) -> bool {
        let handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());
        handled
            .get(&(metadata.topic.clone(), metadata.partition))
            .is_some_and(|&last| metadata.offset <= last)
    }

    pub fn record(&self, metadata: &MessageMetadata) {
        let mut handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());
        let entry = handled
            .entry((metadata.topic.clone(), metadata.partition))
            .or_insert(metadata.offset);
        if metadata.offset > *entry {
            *entry = metadata.offset;
        }
    }

    /// Forget partitions this member no longer owns
    pub fn release(&self, partitions: &TopicPartitionList) {
        let mut handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());
        for elem in partitions.elements() {
            handled.remove(&(elem.topic().to_string(), elem.partition()));
        }
    }

    /// Next offsets to commit, one per owned partition seen
    pub fn commit_positions(&self) -> Vec<(String, i32, i64)> {
        let handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());
        let mut positions: Vec<_> = handled
            .iter()
            .map(|((topic, partition), offset)| (topic.clone(), *partition, offset + 1))
            .collect();
        positions.sort();
        positions
    }
}

/// Runs one message through a handler and commits it.
///
/// Broker-independent so the commit contract can be exercised without Kafka.
#[derive(Debug, Default)]
pub struct Dispatcher {
    tracker: Arc<OffsetTracker>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher recording into a tracker shared with the rebalance callbacks
    pub fn with_tracker(tracker: Arc<OffsetTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    #[instrument(
        skip(self, handler, committer, message),
        fields(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
        )
    )]
    pub async fn dispatch<H, C>(
        &self,
        handler: &H,
        committer: &C,
        message: &IncomingMessage,
    ) -> Result<Disposition, ConsumerError>
    where
        H: MessageHandler + ?Sized,
        C: OffsetCommitter + ?Sized,
    {
        if self.tracker.is_redelivery(&message.metadata) {
            info!("Offset already handled, skipping redelivered message");
            metrics::counter!("kafka.consumer.redelivered").increment(1);
            return Ok(Disposition::Duplicate);
        }

        let disposition = handler.handle(message).await.map_err(|e| {
            error!(error = %e, "Handler failed, offset left uncommitted");
            ConsumerError::Handler(e)
        })?;

        committer.commit(&message.metadata)?;
        self.tracker.record(&message.metadata);

        debug!(disposition = ?disposition, "Offset committed");
        Ok(disposition)
    }
}

/// Why the consumer was asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Fatal(String),
}

/// Cloneable stop switch shared between the signal handler, the error
/// channel task and the consume loop
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. The first reason wins.
    pub fn request(&self, reason: StopReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    pub fn is_requested(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once a stop has been requested
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

/// Errors the broker client reports outside of the message stream
pub type ErrorReceiver = mpsc::UnboundedReceiver<KafkaError>;

/// Client context forwarding asynchronous errors and logging rebalances.
///
/// Revoked partitions are dropped from the offset tracker so the final
/// commit on leaving the group never touches another member's partitions.
pub struct ReelContext {
    errors: mpsc::UnboundedSender<KafkaError>,
    tracker: Arc<OffsetTracker>,
}

impl ReelContext {
    pub fn new(errors: mpsc::UnboundedSender<KafkaError>, tracker: Arc<OffsetTracker>) -> Self {
        Self { errors, tracker }
    }
}

impl ClientContext for ReelContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "Kafka client error");
        let _ = self.errors.send(error);
    }
}

impl ConsumerContext for ReelContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = %describe_partitions(tpl), "Partitions revoked");
                self.tracker.release(tpl);
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = %describe_partitions(tpl), "Partitions being assigned")
            }
            Rebalance::Error(e) => warn!(error = %e, "Rebalance error"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            info!(partitions = %describe_partitions(tpl), "Partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(offsets = %describe_partitions(offsets), "Offsets committed"),
            Err(e) => warn!(error = %e, offsets = %describe_partitions(offsets), "Offset commit failed"),
        }
    }
}

fn describe_partitions(tpl: &TopicPartitionList) -> String {
    tpl.elements()
        .iter()
        .map(|e| format!("{}[{}]", e.topic(), e.partition()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a broker error should take the worker down
pub fn is_fatal_error(error: &KafkaError) -> bool {
    match error {
        KafkaError::ClientCreation(_) | KafkaError::Subscription(_) => true,
        _ => matches!(
            error.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::Fatal
                    | RDKafkaErrorCode::Authentication
                    | RDKafkaErrorCode::SaslAuthenticationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::TopicAuthorizationFailed
            )
        ),
    }
}

/// Drain the asynchronous error channel, escalating the first fatal error
/// into a stop request
pub async fn escalate_fatal_errors(mut errors: ErrorReceiver, shutdown: ShutdownHandle) {
    while let Some(error) = errors.recv().await {
        if is_fatal_error(&error) {
            error!(error = %error, "Fatal Kafka error, stopping worker");
            shutdown.request(StopReason::Fatal(error.to_string()));
            break;
        }
        metrics::counter!("kafka.client.errors").increment(1);
        debug!(error = %error, "Non-fatal Kafka error");
    }
}

/// Kafka consumer-group member
pub struct EventConsumer {
    consumer: StreamConsumer<ReelContext>,
    config: Arc<KafkaConfig>,
    dispatcher: Dispatcher,
    shutdown: ShutdownHandle,
    errors: Option<ErrorReceiver>,
}

impl EventConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(OffsetTracker::new());
        let consumer: StreamConsumer<ReelContext> = config
            .build_consumer_config()
            .create_with_context(ReelContext::new(tx, tracker.clone()))
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        Ok(Self {
            consumer,
            config: Arc::new(config),
            dispatcher: Dispatcher::with_tracker(tracker),
            shutdown: ShutdownHandle::new(),
            errors: Some(rx),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Take the asynchronous error channel. Only the first call gets it.
    pub fn take_errors(&mut self) -> Option<ErrorReceiver> {
        self.errors.take()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(topics = ?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Subscribe to the video events topic
    pub fn subscribe_video_events(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.video_events.as_str()])
    }

    /// Consume until a stop is requested, the stream ends, or an
    /// unrecoverable error occurs. Leaves the group before returning.
    #[instrument(skip(self, handler), fields(group = %self.config.consumer.group_id))]
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let result = self.consume(handler.as_ref()).await;
        self.leave_group();
        result
    }

    async fn consume<H: MessageHandler + ?Sized>(&self, handler: &H) -> Result<(), ConsumerError> {
        let settings = LoopSettings::from_config(&self.config);
        let stream = self
            .consumer
            .stream()
            .map(|next| next.map(|borrowed| IncomingMessage::from_kafka(&borrowed)));

        consume_stream(
            stream,
            handler,
            &self.consumer,
            &self.dispatcher,
            &self.shutdown,
            &settings,
        )
        .await
    }

    /// Synchronously commit everything handled, then leave the group so
    /// partitions are reassigned without waiting for the session timeout
    fn leave_group(&self) {
        let positions = self.dispatcher.tracker().commit_positions();
        if !positions.is_empty() {
            let mut tpl = TopicPartitionList::new();
            for (topic, partition, offset) in &positions {
                if let Err(e) = tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset)) {
                    warn!(error = %e, topic = %topic, partition, "Skipping final commit entry");
                }
            }
            if let Err(e) = Consumer::commit(&self.consumer, &tpl, CommitMode::Sync) {
                warn!(error = %e, "Final offset commit failed");
            }
        }

        self.consumer.unsubscribe();
        info!("Left consumer group");
    }
}

/// Bounds of the consume loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// How long an in-flight message may finish after a stop request
    pub drain_timeout: Duration,
    /// Consecutive stream errors tolerated before giving up
    pub max_consecutive_errors: u32,
}

impl LoopSettings {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            drain_timeout: config.drain_timeout(),
            max_consecutive_errors: config.consumer.max_consecutive_errors,
        }
    }
}

/// Feed messages through the dispatcher until a stop is requested, the
/// stream ends, or the stream keeps failing.
///
/// A message still in flight when the stop arrives gets `drain_timeout` to
/// finish. Past that it is abandoned without a commit.
pub async fn consume_stream<S, H, C>(
    stream: S,
    handler: &H,
    committer: &C,
    dispatcher: &Dispatcher,
    shutdown: &ShutdownHandle,
    settings: &LoopSettings,
) -> Result<(), ConsumerError>
where
    S: Stream<Item = KafkaResult<IncomingMessage>>,
    H: MessageHandler + ?Sized,
    C: OffsetCommitter + ?Sized,
{
    let drain_timeout = settings.drain_timeout;
    let mut consecutive_errors = 0u32;
    tokio::pin!(stream);

    info!("Starting message consumption loop");

    'consume: loop {
        if shutdown.is_requested() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.requested() => break 'consume,
            next = stream.next() => match next {
                Some(Ok(incoming)) => {
                    consecutive_errors = 0;

                    let work = dispatcher.dispatch(handler, committer, &incoming);
                    tokio::pin!(work);

                    let outcome = tokio::select! {
                        biased;
                        res = &mut work => res,
                        _ = shutdown.requested() => {
                            info!(
                                offset = incoming.metadata.offset,
                                timeout_ms = drain_timeout.as_millis() as u64,
                                "Stop requested, draining in-flight message"
                            );
                            match tokio::time::timeout(drain_timeout, &mut work).await {
                                Ok(res) => res,
                                Err(_) => {
                                    warn!(
                                        topic = %incoming.metadata.topic,
                                        partition = incoming.metadata.partition,
                                        offset = incoming.metadata.offset,
                                        "Drain timeout elapsed, abandoning message uncommitted"
                                    );
                                    break 'consume;
                                }
                            }
                        }
                    };

                    outcome?;
                }
                Some(Err(e)) => {
                    if is_fatal_error(&e) {
                        error!(error = %e, "Fatal error from message stream");
                        return Err(ConsumerError::Fatal(e.to_string()));
                    }

                    consecutive_errors += 1;
                    metrics::counter!("kafka.consumer.errors").increment(1);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        "Kafka consumer error"
                    );
                    if consecutive_errors >= settings.max_consecutive_errors {
                        return Err(ConsumerError::Fatal(format!(
                            "{} consecutive broker errors, last: {}",
                            consecutive_errors, e
                        )));
                    }
                }
                None => {
                    debug!("Stream ended");
                    break 'consume;
                }
            }
        }
    }

    if let Some(StopReason::Fatal(reason)) = shutdown.reason() {
        return Err(ConsumerError::Fatal(reason));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(partition: i32, offset: i64) -> MessageMetadata {
        MessageMetadata {
            topic: "video-events".to_string(),
            partition,
            offset,
            key: None,
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_incoming_message_headers() {
        let mut meta = metadata(0, 100);
        meta.key = Some(b"key".to_vec());
        meta.headers
            .insert("correlation-id".to_string(), "vid-123".to_string());

        let message = IncomingMessage {
            payload: vec![1, 2, 3],
            metadata: meta,
        };

        assert_eq!(message.correlation_id(), Some("vid-123"));
        assert_eq!(message.key_str(), Some("key".to_string()));
    }

    #[test]
    fn test_offset_tracker_per_partition() {
        let tracker = OffsetTracker::new();
        tracker.record(&metadata(0, 5));
        tracker.record(&metadata(1, 2));

        assert!(tracker.is_redelivery(&metadata(0, 5)));
        assert!(tracker.is_redelivery(&metadata(0, 3)));
        assert!(!tracker.is_redelivery(&metadata(0, 6)));
        assert!(!tracker.is_redelivery(&metadata(2, 0)));

        assert_eq!(
            tracker.commit_positions(),
            vec![
                ("video-events".to_string(), 0, 6),
                ("video-events".to_string(), 1, 3),
            ]
        );
    }

    fn partitions(list: &[i32]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for &partition in list {
            tpl.add_partition("video-events", partition);
        }
        tpl
    }

    #[test]
    fn test_released_partitions_leave_final_commit() {
        let tracker = OffsetTracker::new();
        tracker.record(&metadata(0, 4));
        tracker.record(&metadata(1, 10));

        tracker.release(&partitions(&[1]));

        assert_eq!(
            tracker.commit_positions(),
            vec![("video-events".to_string(), 0, 5)]
        );
        assert!(!tracker.is_redelivery(&metadata(1, 10)));
    }

    #[test]
    fn test_rebalance_callbacks_release_revoked_partitions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(OffsetTracker::new());
        let context = ReelContext::new(tx, tracker.clone());
        tracker.record(&metadata(0, 4));
        tracker.record(&metadata(1, 10));

        let assigned = partitions(&[0, 1, 2]);
        context.pre_rebalance(&Rebalance::Assign(&assigned));
        context.post_rebalance(&Rebalance::Assign(&assigned));
        assert_eq!(tracker.commit_positions().len(), 2);

        let revoked = partitions(&[1]);
        context.pre_rebalance(&Rebalance::Revoke(&revoked));
        context.post_rebalance(&Rebalance::Revoke(&revoked));

        assert_eq!(
            tracker.commit_positions(),
            vec![("video-events".to_string(), 0, 5)]
        );
    }

    #[test]
    fn test_offset_tracker_never_moves_backwards() {
        let tracker = OffsetTracker::new();
        tracker.record(&metadata(0, 9));
        tracker.record(&metadata(0, 4));
        assert_eq!(tracker.commit_positions()[0].2, 10);
    }

    #[test]
    fn test_fatal_error_classification() {
        assert!(is_fatal_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::Fatal
        )));
        assert!(is_fatal_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::SaslAuthenticationFailed
        )));
        assert!(!is_fatal_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
    }

    #[test]
    fn test_shutdown_first_reason_wins() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_requested());

        handle.request(StopReason::Fatal("auth".to_string()));
        handle.request(StopReason::Interrupted);

        assert_eq!(handle.reason(), Some(StopReason::Fatal("auth".to_string())));
    }

    #[tokio::test]
    async fn test_requested_resolves_after_request() {
        let handle = ShutdownHandle::new();
        handle.clone().request(StopReason::Interrupted);
        tokio::time::timeout(Duration::from_secs(1), handle.requested())
            .await
            .expect("stop request should be observed");
    }

    #[tokio::test]
    async fn test_escalate_fatal_errors_requests_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ShutdownHandle::new();

        tx.send(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure,
        ))
        .unwrap();
        tx.send(KafkaError::MessageConsumption(RDKafkaErrorCode::Authentication))
            .unwrap();

        escalate_fatal_errors(rx, handle.clone()).await;

        assert!(matches!(handle.reason(), Some(StopReason::Fatal(_))));
    }
}
