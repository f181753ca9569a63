//! Chunk Pipeline
//!
//! Batches a continuous stream of crawled records into bounded chunks and
//! uploads each chunk as a single object to S3 or Google Cloud Storage.
//!
//! ## Features
//!
//! - **Size and time based chunking**: a chunk closes after `max_chunk_size`
//!   records, or `max_wait_upload_time` seconds after the last record
//! - **Templated object keys**: `{chunk}`, `{time}` and any caller attribute,
//!   with zero-padding (`{chunk:07d}`)
//! - **JSON Lines or JSON array output**, gzip-compressed when the key ends
//!   in `.gz`
//! - **Pluggable storage**: the URL scheme picks the backend
//!
//! ## Architecture
//!
//! ```text
//!  submit(record)          ┌──────────────┐
//! ────────────────────────▶│ Chunk        │── deadline task ──┐
//!                          │ Uploader     │◀──────────────────┘
//!                          └──────────────┘
//!                                 │ flush
//!                 ┌───────────────┼────────────────┐
//!                 ▼               ▼                ▼
//!          ┌────────────┐  ┌────────────┐  ┌──────────────┐
//!          │ Encoder    │  │ Key        │  │ Storage      │
//!          │ (jl/json,  │  │ Template   │  │ Backend      │
//!          │  gzip)     │  │            │  │ (S3 / GCS)   │
//!          └────────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chunk_pipeline::{
//!     backend_for_settings, ChunkUploader, Config, PipelineSettings, Record, SessionContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let settings = PipelineSettings::from_config(&config.pipeline)?;
//!     let backend = backend_for_settings(&settings, &config).await?;
//!
//!     let uploader = ChunkUploader::new(settings, backend);
//!     uploader.open(SessionContext::new().with_attribute("name", "quotes")).await?;
//!
//!     uploader
//!         .submit(Record::new().with_field("url", "http://example.com"))
//!         .await?;
//!
//!     uploader.close().await?;
//!     Ok(())
//! }
//! ```

pub mod chunk_uploader;
pub mod config;
pub mod encoder;
pub mod item;
pub mod key_template;
pub mod storage;

pub use chunk_uploader::{
    ChunkUploader, FailurePolicy, PipelineError, SessionContext, UploadStats,
    UPLOAD_FAILURE_COUNTER, UPLOAD_SUCCESS_COUNTER,
};
pub use config::{
    Config, ConfigError, GcsConfig, PipelineConfig, PipelineSettings, S3Config, ServiceConfig,
    StorageScheme, StorageUrl,
};
pub use encoder::{encode, ChunkFormat, EncodeError, EncoderOptions};
pub use item::{Page, Record};
pub use key_template::{KeyTemplate, TemplateError, TemplateParams, TemplateValue};
pub use storage::{
    backend_for_settings, GcsBackend, ObjectHeaders, S3Backend, StorageBackend, UploadError,
};
