use crate::catalog_store::{CatalogStore, StoreError};
use crate::config::ApiConfig;
use crate::object_store::{content_type_for, object_key_for, ObjectStore, ObjectStoreError};
use crate::video::{CreateVideoForm, FormError, NewVideo, Video};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use reel_events::{DomainEvent, EventSink};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventSink>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Request failures and their HTTP mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    InvalidForm(#[from] FormError),

    #[error("Malformed video id: {0}")]
    InvalidId(String),

    #[error("Video {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upload(#[from] ObjectStoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidForm(_) | ApiError::InvalidId(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upload(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidForm(_) => "INVALID_REQUEST",
            ApiError::InvalidId(_) => "INVALID_ID",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Store(_) => "DATABASE_ERROR",
            ApiError::Upload(_) => "UPLOAD_FAILED",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        } else {
            warn!(error = %self, code = self.code(), "Request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/videos", get(list_videos).post(create_video))
        .route("/videos/:id", get(get_video))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "catalog-service"
    }))
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// All videos, newest first
pub async fn list_videos(State(state): State<AppState>) -> Result<Json<Vec<Video>>, ApiError> {
    let videos = state.store.find_all().await?;
    Ok(Json(videos))
}

#[instrument(skip(state))]
pub async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Video>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::InvalidId(id))?;

    state
        .store
        .find_by_id(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

/// Upload the file, record the video, then announce it on the event channel
#[instrument(skip(state, multipart))]
pub async fn create_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<Video>), ApiError> {
    let multipart = multipart.map_err(|e| FormError::Malformed(e.body_text()))?;
    let (details, file) = CreateVideoForm::from_multipart(multipart).await?.validate()?;

    let key = object_key_for(file.file_name.as_deref(), Utc::now());
    let content_type = content_type_for(file.content_type.as_deref(), file.file_name.as_deref());
    let size_bytes = file.data.len();

    let url = state.objects.put_object(&key, file.data, &content_type).await?;
    metrics::counter!("catalog.uploads.bytes").increment(size_bytes as u64);

    let video = match state.store.insert(NewVideo::new(details, url)).await {
        Ok(video) => video,
        Err(e) => {
            warn!(key = %key, error = %e, "Video record not stored, uploaded object is orphaned");
            metrics::counter!("catalog.objects.orphaned").increment(1);
            return Err(e.into());
        }
    };
    metrics::counter!("catalog.videos.created").increment(1);

    // The record exists at this point; a lost event does not undo the create.
    let event = DomainEvent::video_created(video.id.to_string());
    match state.events.publish_event(&event).await {
        Ok(delivery) => info!(
            video_id = %video.id,
            partition = delivery.partition,
            offset = delivery.offset,
            "Video created"
        ),
        Err(e) => {
            error!(
                video_id = %video.id,
                error = %e,
                "Video created but the event could not be published"
            );
            metrics::counter!("catalog.events.publish_failed").increment(1);
        }
    }

    Ok((StatusCode::CREATED, Json(video)))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting catalog API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
