//! Domain events exchanged over the video events topic.
//!
//! Wire format is JSON: `{ "eventType": "VIDEO_CREATED", "videoID": "..." }`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Discriminant value of the only event the conversion worker acts upon.
pub const VIDEO_CREATED: &str = "VIDEO_CREATED";

/// Errors from decoding an event payload
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event has an empty video id")]
    EmptyVideoId,
}

/// Event type discriminant.
///
/// Unknown values are kept verbatim so consumers can log and skip them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    VideoCreated,
    Other(String),
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        if value == VIDEO_CREATED {
            EventType::VideoCreated
        } else {
            EventType::Other(value)
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::VideoCreated => VIDEO_CREATED.to_string(),
            EventType::Other(other) => other,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::VideoCreated => f.write_str(VIDEO_CREATED),
            EventType::Other(other) => f.write_str(other),
        }
    }
}

/// Envelope published once per video lifecycle change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "videoID")]
    pub video_id: String,
}

impl DomainEvent {
    pub fn new(event_type: EventType, video_id: impl Into<String>) -> Self {
        Self {
            event_type,
            video_id: video_id.into(),
        }
    }

    pub fn video_created(video_id: impl Into<String>) -> Self {
        Self::new(EventType::VideoCreated, video_id)
    }

    /// Decode a raw payload. Any failure here marks the message as poison.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let event: DomainEvent = serde_json::from_slice(payload)?;
        if event.video_id.trim().is_empty() {
            return Err(EventError::EmptyVideoId);
        }
        Ok(event)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_video_created(&self) -> bool {
        self.event_type == EventType::VideoCreated
    }
}
