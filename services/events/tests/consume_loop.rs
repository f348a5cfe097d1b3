//! Stop, drain and error-threshold behaviour of the consume loop, driven by
//! an in-memory stream on a paused clock.

use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use reel_events::{
    async_trait, consume_stream, ConsumerError, Dispatcher, Disposition, HandlerError,
    IncomingMessage, LoopSettings, MessageHandler, MessageMetadata, OffsetCommitter,
    ShutdownHandle, StopReason,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingCommitter {
    committed: Mutex<Vec<(i32, i64)>>,
}

impl RecordingCommitter {
    fn committed(&self) -> Vec<(i32, i64)> {
        self.committed.lock().unwrap().clone()
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        self.committed
            .lock()
            .unwrap()
            .push((metadata.partition, metadata.offset));
        Ok(())
    }
}

/// Takes `work` to finish each message, optionally asking the loop to stop
/// as soon as it starts
struct SlowHandler {
    shutdown: ShutdownHandle,
    work: Duration,
    stop_on_start: bool,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _message: &IncomingMessage) -> Result<Disposition, HandlerError> {
        if self.stop_on_start {
            self.shutdown.request(StopReason::Interrupted);
        }
        tokio::time::sleep(self.work).await;
        Ok(Disposition::Handled)
    }
}

fn message(offset: i64) -> IncomingMessage {
    IncomingMessage {
        payload: br#"{"eventType":"VIDEO_CREATED","videoID":"64f1ab"}"#.to_vec(),
        metadata: MessageMetadata {
            topic: "video-events".to_string(),
            partition: 0,
            offset,
            key: None,
            timestamp: None,
            headers: HashMap::new(),
        },
    }
}

fn transport_error() -> KafkaError {
    KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure)
}

fn settings(max_consecutive_errors: u32) -> LoopSettings {
    LoopSettings {
        drain_timeout: Duration::from_secs(5),
        max_consecutive_errors,
    }
}

fn handler(shutdown: &ShutdownHandle, work: Duration, stop_on_start: bool) -> SlowHandler {
    SlowHandler {
        shutdown: shutdown.clone(),
        work,
        stop_on_start,
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_message_abandoned_after_drain_timeout() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::from_secs(60), true);
    let committer = RecordingCommitter::default();
    let dispatcher = Dispatcher::new();
    let started = Instant::now();

    let result = consume_stream(
        tokio_stream::iter(vec![Ok(message(0))]),
        &handler,
        &committer,
        &dispatcher,
        &shutdown,
        &settings(3),
    )
    .await;

    assert!(result.is_ok());
    assert!(committer.committed().is_empty());
    assert!(dispatcher.tracker().commit_positions().is_empty());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_message_finishing_within_drain_is_committed() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::from_secs(1), true);
    let committer = RecordingCommitter::default();

    let result = consume_stream(
        tokio_stream::iter(vec![Ok(message(0)), Ok(message(1))]),
        &handler,
        &committer,
        &Dispatcher::new(),
        &shutdown,
        &settings(3),
    )
    .await;

    assert!(result.is_ok());
    // The second message is never started once a stop is pending
    assert_eq!(committer.committed(), vec![(0, 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_request_while_idle_ends_loop() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::ZERO, false);
    let committer = RecordingCommitter::default();

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.request(StopReason::Interrupted);
    });

    let result = consume_stream(
        tokio_stream::pending::<KafkaResult<IncomingMessage>>(),
        &handler,
        &committer,
        &Dispatcher::new(),
        &shutdown,
        &settings(3),
    )
    .await;

    assert!(result.is_ok());
    assert!(committer.committed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_stop_reason_is_returned() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::ZERO, false);

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.request(StopReason::Fatal("authentication failed".to_string()));
    });

    let result = consume_stream(
        tokio_stream::pending::<KafkaResult<IncomingMessage>>(),
        &handler,
        &RecordingCommitter::default(),
        &Dispatcher::new(),
        &shutdown,
        &settings(3),
    )
    .await;

    assert!(matches!(result, Err(ConsumerError::Fatal(reason)) if reason == "authentication failed"));
}

#[tokio::test]
async fn test_consecutive_stream_errors_become_fatal() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::ZERO, false);
    let committer = RecordingCommitter::default();

    let stream = tokio_stream::iter(vec![
        Err(transport_error()),
        Err(transport_error()),
        Err(transport_error()),
        Ok(message(0)),
    ]);

    let result = consume_stream(
        stream,
        &handler,
        &committer,
        &Dispatcher::new(),
        &shutdown,
        &settings(3),
    )
    .await;

    match result {
        Err(ConsumerError::Fatal(reason)) => assert!(reason.starts_with("3 consecutive")),
        other => panic!("expected fatal error, got {:?}", other),
    }
    assert!(committer.committed().is_empty());
}

#[tokio::test]
async fn test_message_resets_error_count() {
    let shutdown = ShutdownHandle::new();
    let handler = handler(&shutdown, Duration::ZERO, false);
    let committer = RecordingCommitter::default();

    let stream = tokio_stream::iter(vec![
        Err(transport_error()),
        Err(transport_error()),
        Ok(message(0)),
        Err(transport_error()),
        Err(transport_error()),
    ]);

    let result = consume_stream(
        stream,
        &handler,
        &committer,
        &Dispatcher::new(),
        &shutdown,
        &settings(3),
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(committer.committed(), vec![(0, 0)]);
}
