//! Reel Conversion Worker
//!
//! Consumer-group member on the video events topic. For each
//! `VIDEO_CREATED` event it starts format conversion, then commits the
//! offset. Other event types and undecodable payloads are committed without
//! side effects.

pub mod config;
pub mod converter;
pub mod handler;

pub use config::{Config, FailurePolicy, WorkerConfig};
pub use converter::{ConversionTrigger, LoggingConverter, TriggerError};
pub use handler::VideoEventHandler;

use anyhow::Context;
use reel_events::{escalate_fatal_errors, EventConsumer, EventPublisher, StopReason};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Background tasks tied to one worker run; aborted when dropped
#[derive(Default)]
struct WorkerTasks {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerTasks {
    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }
}

impl Drop for WorkerTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Consume video events until `shutdown_signal` resolves or the consumer
/// hits an unrecoverable error.
///
/// Returns an error when the worker stopped for any reason other than the
/// signal, so the process can exit non-zero.
pub async fn run_worker(
    config: Config,
    trigger: Arc<dyn ConversionTrigger>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let mut consumer =
        EventConsumer::new(config.kafka.clone()).context("Failed to create Kafka consumer")?;
    consumer
        .subscribe_video_events()
        .context("Failed to subscribe to video events")?;

    let publisher = Arc::new(
        EventPublisher::new(config.kafka.clone()).context("Failed to create dead letter publisher")?,
    );

    let shutdown = consumer.shutdown_handle();
    let mut tasks = WorkerTasks::default();
    if let Some(errors) = consumer.take_errors() {
        tasks.spawn(escalate_fatal_errors(errors, shutdown.clone()));
    }
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            shutdown_signal.await;
            shutdown.request(StopReason::Interrupted);
        });
    }

    let handler = Arc::new(VideoEventHandler::new(
        trigger,
        publisher.clone(),
        config.worker.clone(),
    ));

    info!(
        group = %config.kafka.consumer.group_id,
        topic = %config.kafka.topics.video_events,
        policy = ?config.worker.failure_policy,
        "Conversion worker started"
    );

    let result = consumer.run(handler).await;
    drop(tasks);
    drop(consumer);

    match Arc::try_unwrap(publisher) {
        Ok(publisher) => {
            if let Err(e) = publisher.close(config.flush_timeout()) {
                warn!(error = %e, "Failed to flush dead letter publisher");
            }
        }
        Err(_) => warn!("Dead letter publisher still shared at shutdown, skipping flush"),
    }

    result.context("Conversion worker stopped")?;
    info!("Conversion worker stopped");
    Ok(())
}
