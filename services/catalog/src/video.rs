//! Video records and the multipart form that creates them.

use axum::extract::Multipart;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Highest accepted age rating
pub const MAX_AGE_RATING: i32 = 21;

/// A catalogued video. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Video {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub genre: String,
    pub age_rating: i32,
    pub created_at: DateTime<Utc>,
    /// Where the uploaded file can be fetched from
    pub url: String,
}

/// Fields of a video before the store assigns its id and creation time
#[derive(Debug, Clone, PartialEq)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub genre: String,
    pub age_rating: i32,
    pub url: String,
}

impl NewVideo {
    pub fn new(details: VideoDetails, url: impl Into<String>) -> Self {
        Self {
            title: details.title,
            description: details.description,
            genre: details.genre,
            age_rating: details.age_rating,
            url: url.into(),
        }
    }

    /// Materialize the record with a fresh id
    pub fn into_video(self, created_at: DateTime<Utc>) -> Video {
        Video {
            id: Uuid::new_v4(),
            title: self.title,
            description: self.description,
            genre: self.genre,
            age_rating: self.age_rating,
            created_at,
            url: self.url,
        }
    }
}

/// Validated descriptive fields of an upload
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDetails {
    pub title: String,
    pub description: String,
    pub genre: String,
    pub age_rating: i32,
}

/// The binary part of an upload
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Errors from reading or validating the create form
#[derive(Error, Debug, PartialEq)]
pub enum FormError {
    #[error("Malformed multipart body: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Raw `POST /videos` form, as read off the wire
#[derive(Debug, Clone, Default)]
pub struct CreateVideoForm {
    pub title: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub age_rating: Option<String>,
    pub video_file: Option<UploadedFile>,
}

impl CreateVideoForm {
    /// Read every part of the multipart body. Unknown parts are skipped.
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, FormError> {
        let mut form = CreateVideoForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| FormError::Malformed(e.body_text()))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            match name.as_str() {
                "video_file" => {
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let data = field
                        .bytes()
                        .await
                        .map_err(|e| FormError::Malformed(e.body_text()))?;
                    form.video_file = Some(UploadedFile {
                        file_name,
                        content_type,
                        data,
                    });
                }
                "title" | "description" | "genre" | "age_rating" => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| FormError::Malformed(e.body_text()))?;
                    match name.as_str() {
                        "title" => form.title = Some(value),
                        "description" => form.description = Some(value),
                        "genre" => form.genre = Some(value),
                        _ => form.age_rating = Some(value),
                    }
                }
                _ => {}
            }
        }

        Ok(form)
    }

    /// Check required fields and split the form into details and file
    pub fn validate(self) -> Result<(VideoDetails, UploadedFile), FormError> {
        let title = required(self.title, "title")?;
        let genre = required(self.genre, "genre")?;
        let age_rating = required(self.age_rating, "age_rating")?;

        let age_rating: i32 = age_rating
            .parse()
            .map_err(|_| FormError::InvalidField {
                field: "age_rating",
                message: format!("not an integer: {}", age_rating),
            })?;
        if !(0..=MAX_AGE_RATING).contains(&age_rating) {
            return Err(FormError::InvalidField {
                field: "age_rating",
                message: format!("must be between 0 and {}", MAX_AGE_RATING),
            });
        }

        let file = self
            .video_file
            .ok_or(FormError::MissingField("video_file"))?;
        if file.data.is_empty() {
            return Err(FormError::InvalidField {
                field: "video_file",
                message: "file is empty".to_string(),
            });
        }

        let details = VideoDetails {
            title,
            description: self
                .description
                .map(|d| d.trim().to_string())
                .unwrap_or_default(),
            genre,
            age_rating,
        };

        Ok((details, file))
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, FormError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(FormError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_form() -> CreateVideoForm {
        CreateVideoForm {
            title: Some("The Matrix".to_string()),
            description: Some("  Red pill or blue pill  ".to_string()),
            genre: Some("sci-fi".to_string()),
            age_rating: Some("16".to_string()),
            video_file: Some(UploadedFile {
                file_name: Some("matrix.mp4".to_string()),
                content_type: Some("video/mp4".to_string()),
                data: Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"),
            }),
        }
    }

    #[test]
    fn test_validate_complete_form() {
        let (details, file) = complete_form().validate().unwrap();
        assert_eq!(details.title, "The Matrix");
        assert_eq!(details.description, "Red pill or blue pill");
        assert_eq!(details.age_rating, 16);
        assert_eq!(file.file_name.as_deref(), Some("matrix.mp4"));
    }

    #[test]
    fn test_description_is_optional() {
        let form = CreateVideoForm {
            description: None,
            ..complete_form()
        };
        let (details, _) = form.validate().unwrap();
        assert_eq!(details.description, "");
    }

    #[test]
    fn test_missing_required_fields() {
        let form = CreateVideoForm {
            title: Some("   ".to_string()),
            ..complete_form()
        };
        assert_eq!(form.validate().unwrap_err(), FormError::MissingField("title"));

        let form = CreateVideoForm {
            video_file: None,
            ..complete_form()
        };
        assert_eq!(
            form.validate().unwrap_err(),
            FormError::MissingField("video_file")
        );
    }

    #[test]
    fn test_age_rating_bounds() {
        for bad in ["abc", "-1", "22", "4.5"] {
            let form = CreateVideoForm {
                age_rating: Some(bad.to_string()),
                ..complete_form()
            };
            assert!(
                matches!(
                    form.validate(),
                    Err(FormError::InvalidField {
                        field: "age_rating",
                        ..
                    })
                ),
                "accepted age rating {}",
                bad
            );
        }

        let form = CreateVideoForm {
            age_rating: Some("0".to_string()),
            ..complete_form()
        };
        assert!(form.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_rejected() {
        let form = CreateVideoForm {
            video_file: Some(UploadedFile {
                file_name: Some("empty.mp4".to_string()),
                content_type: None,
                data: Bytes::new(),
            }),
            ..complete_form()
        };
        assert!(matches!(
            form.validate(),
            Err(FormError::InvalidField {
                field: "video_file",
                ..
            })
        ));
    }

    #[test]
    fn test_new_video_gets_fresh_id() {
        let (details, _) = complete_form().validate().unwrap();
        let new_video = NewVideo::new(details, "http://localhost:9000/videos/a.mp4");
        let now = Utc::now();
        let a = new_video.clone().into_video(now);
        let b = new_video.into_video(now);
        assert_ne!(a.id, b.id);
        assert_eq!(a.url, "http://localhost:9000/videos/a.mp4");
    }
}
