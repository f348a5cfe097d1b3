//! Reel Catalog Service
//!
//! HTTP API over the video catalog. Uploads land in an S3-compatible object
//! store, metadata in PostgreSQL, and every successful create is announced
//! on the video events topic for the conversion worker.
//!
//! ## Architecture
//!
//! ```text
//!  POST /videos            ┌──────────────┐
//! ───────────────────────▶ │ Object Store │  (S3 / MinIO, bucket "videos")
//!        │                 └──────────────┘
//!        │                 ┌──────────────┐
//!        ├───────────────▶ │ Catalog      │  (PostgreSQL or in-memory)
//!        │                 │ Store        │
//!        │                 └──────────────┘
//!        │                 ┌──────────────┐
//!        └───────────────▶ │ video-events │──▶ conversion worker
//!                          └──────────────┘
//! ```

pub mod api;
pub mod catalog_store;
pub mod config;
pub mod object_store;
pub mod video;

pub use api::{create_router, start_api_server, ApiError, AppState, ErrorResponse};
pub use catalog_store::{CatalogStore, InMemoryCatalogStore, PgCatalogStore, StoreError};
pub use config::Config;
pub use object_store::{content_type_for, object_key_for, ObjectStore, ObjectStoreError, S3ObjectStore};
pub use video::{CreateVideoForm, FormError, NewVideo, UploadedFile, Video, VideoDetails};
