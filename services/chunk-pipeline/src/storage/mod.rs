//! Storage backends.
//!
//! A backend performs exactly one thing: put a fully encoded chunk under a
//! bucket and key. The uploader does not look inside upload errors; it only
//! counts and propagates them. Backends never retry on their own.

mod gcs;
mod s3;

pub use gcs::GcsBackend;
pub use s3::S3Backend;

use crate::config::{Config, ConfigError, PipelineSettings, StorageScheme};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// A failed upload, whatever the underlying transport/auth/permission cause
#[derive(Error, Debug)]
#[error("{backend} upload to {bucket}/{key} failed: {source}")]
pub struct UploadError {
    pub backend: &'static str,
    pub bucket: String,
    pub key: String,
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl UploadError {
    pub fn new(
        backend: &'static str,
        bucket: &str,
        key: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            backend,
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: source.into(),
        }
    }
}

/// Upload capability shared by all storage providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `body` as the object `key` in `bucket`
    async fn upload(&self, body: Bytes, bucket: &str, key: &str) -> Result<(), UploadError>;

    /// Short backend name for logs and errors
    fn name(&self) -> &'static str;
}

/// Content type for gzipped chunks
const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Headers attached to every uploaded object.
///
/// Gzipped chunks are stored as `application/gzip` without a
/// `Content-Encoding`, so readers get the compressed bytes back as written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_type: &'static str,
}

impl ObjectHeaders {
    pub fn for_settings(settings: &PipelineSettings) -> Self {
        let content_type = if settings.use_gzip {
            GZIP_CONTENT_TYPE
        } else {
            settings.format.content_type()
        };
        Self { content_type }
    }
}

/// Build the backend selected by the storage URL scheme
pub async fn backend_for_settings(
    settings: &PipelineSettings,
    config: &Config,
) -> Result<Arc<dyn StorageBackend>, ConfigError> {
    let headers = ObjectHeaders::for_settings(settings);

    let backend: Arc<dyn StorageBackend> = match settings.url.scheme {
        StorageScheme::S3 => Arc::new(S3Backend::new(&config.s3).await.with_headers(headers)),
        StorageScheme::Gcs => {
            let backend = GcsBackend::new(config.gcs.clone()).with_headers(headers);
            // Surface bad credentials now rather than on the first flush
            backend
                .store_for(&settings.url.bucket)
                .map_err(|e| ConfigError::Backend(e.to_string()))?;
            Arc::new(backend)
        }
    };

    info!(
        backend = backend.name(),
        bucket = %settings.url.bucket,
        "Storage backend initialized"
    );

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn test_upload_error_display() {
        let err = UploadError::new("s3", "my-bucket", "a/b.jl", "access denied");
        assert_eq!(err.to_string(), "s3 upload to my-bucket/a/b.jl failed: access denied");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_object_headers() {
        let gz = PipelineSettings::from_config(&PipelineConfig::new("s3://b/items.{chunk}.jl.gz")).unwrap();
        assert_eq!(
            ObjectHeaders::for_settings(&gz),
            ObjectHeaders {
                content_type: "application/gzip",
            }
        );

        let json = PipelineSettings::from_config(&PipelineConfig::new("gs://b/items.{chunk}.json")).unwrap();
        assert_eq!(
            ObjectHeaders::for_settings(&json),
            ObjectHeaders {
                content_type: "application/json",
            }
        );
    }

    #[tokio::test]
    async fn test_mock_backend_receives_bucket_and_key() {
        let mut backend = MockStorageBackend::new();
        backend
            .expect_upload()
            .withf(|body, bucket, key| &body[..] == b"{}\n" && bucket == "my-bucket" && key == "k")
            .times(1)
            .returning(|_, _, _| Ok(()));

        backend
            .upload(Bytes::from_static(b"{}\n"), "my-bucket", "k")
            .await
            .unwrap();
    }
}
