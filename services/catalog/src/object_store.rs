use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors from the object store
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Multipart upload of {0} returned no upload id")]
    MissingUploadId(String),
}

impl ObjectStoreError {
    fn upload(key: &str, error: impl std::fmt::Display) -> Self {
        ObjectStoreError::Upload {
            key: key.to_string(),
            message: error.to_string(),
        }
    }
}

/// Blob storage for uploaded video files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` and return the URL it can be fetched from
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;
}

/// S3-compatible object store (AWS S3, MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    config: S3Config,
    public_base_url: String,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self {
            client,
            config: config.clone(),
            public_base_url: config.public_base_url(),
        }
    }

    /// Public URL of an object in the configured bucket
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, self.config.bucket, key)
    }

    async fn simple_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::upload(key, e))?;

        Ok(())
    }

    async fn multipart_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let api = S3Multipart {
            client: &self.client,
            bucket: &self.config.bucket,
        };
        upload_in_parts(&api, key, data, content_type, self.config.part_size_bytes).await
    }
}

/// The multipart calls of an S3 bucket
#[cfg_attr(test, mockall::automock)]
#[async_trait]
trait MultipartApi: Send + Sync {
    /// Start an upload and return its id
    async fn create(&self, key: &str, content_type: &str) -> Result<String, ObjectStoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, ObjectStoreError>;

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), ObjectStoreError>;

    /// Discard an upload and every part stored for it
    async fn abort(&self, key: &str, upload_id: &str) -> Result<(), ObjectStoreError>;
}

struct S3Multipart<'a> {
    client: &'a S3Client,
    bucket: &'a str,
}

#[async_trait]
impl MultipartApi for S3Multipart<'_> {
    async fn create(&self, key: &str, content_type: &str) -> Result<String, ObjectStoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::upload(key, e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::MissingUploadId(key.to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, ObjectStoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::upload(key, e))?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(response.e_tag().unwrap_or_default())
            .build())
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), ObjectStoreError> {
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| ObjectStoreError::upload(key, e))?;

        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<(), ObjectStoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| ObjectStoreError::upload(key, e))?;

        Ok(())
    }
}

/// Upload `data` in `part_size` chunks. Any failure after the upload was
/// started aborts it so no parts are left behind.
async fn upload_in_parts<A: MultipartApi + ?Sized>(
    api: &A,
    key: &str,
    data: Bytes,
    content_type: &str,
    part_size: usize,
) -> Result<(), ObjectStoreError> {
    let upload_id = api.create(key, content_type).await?;

    let result = send_parts(api, key, &upload_id, &data, part_size).await;
    if let Err(e) = &result {
        warn!(key, upload_id = %upload_id, error = %e, "Multipart upload failed, aborting");
        if let Err(abort_err) = api.abort(key, &upload_id).await {
            warn!(
                key,
                upload_id = %upload_id,
                error = %abort_err,
                "Failed to abort multipart upload, parts left in bucket"
            );
        }
    }
    result
}

async fn send_parts<A: MultipartApi + ?Sized>(
    api: &A,
    key: &str,
    upload_id: &str,
    data: &Bytes,
    part_size: usize,
) -> Result<(), ObjectStoreError> {
    let mut completed_parts = Vec::new();
    for (index, chunk) in data.chunks(part_size).enumerate() {
        let part_number = index as i32 + 1;
        let part = api
            .upload_part(key, upload_id, part_number, data.slice_ref(chunk))
            .await?;
        completed_parts.push(part);
    }

    api.complete(key, upload_id, completed_parts).await
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(bucket = %self.config.bucket, size_bytes = data.len()))]
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        debug!(key, content_type, "Uploading object");

        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, data, content_type).await?;
        } else {
            self.simple_upload(key, data, content_type).await?;
        }

        info!(key, "Object uploaded");
        Ok(self.object_url(key))
    }
}

/// Object key for an upload: `<unix-seconds>-<uuid><ext>`
pub fn object_key_for(file_name: Option<&str>, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}{}",
        now.timestamp(),
        Uuid::new_v4(),
        extension_of(file_name)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default()
    )
}

/// Content type of an upload. The part's declared type wins, then the file
/// extension, then `application/octet-stream`.
pub fn content_type_for(declared: Option<&str>, file_name: Option<&str>) -> String {
    if let Some(declared) = declared.map(str::trim).filter(|d| !d.is_empty()) {
        return declared.to_string();
    }

    let content_type = match extension_of(file_name).as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    };
    content_type.to_string()
}

/// Lowercased extension, or None if it is missing or not plain alphanumerics
fn extension_of(file_name: Option<&str>) -> Option<String> {
    let ext = Path::new(file_name?).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
