//! Conversion collaborator invoked once per `VIDEO_CREATED` event.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Errors from starting a conversion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Worth retrying: the converter backend was busy or unreachable
    #[error("Conversion of video {video_id} temporarily unavailable: {message}")]
    Transient { video_id: String, message: String },

    /// Retrying will not help
    #[error("Conversion of video {video_id} failed: {message}")]
    Permanent { video_id: String, message: String },
}

impl TriggerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TriggerError::Transient { .. })
    }
}

/// Starts format conversion for a newly created video
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversionTrigger: Send + Sync {
    async fn trigger(&self, video_id: &str) -> Result<(), TriggerError>;
}

/// Conversion stub: records the request and succeeds
#[derive(Debug, Default, Clone)]
pub struct LoggingConverter;

#[async_trait]
impl ConversionTrigger for LoggingConverter {
    async fn trigger(&self, video_id: &str) -> Result<(), TriggerError> {
        info!(video_id = %video_id, "Video created, converting to other formats");
        Ok(())
    }
}
