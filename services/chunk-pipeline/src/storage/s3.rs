use super::{ObjectHeaders, StorageBackend, UploadError};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

const BACKEND_NAME: &str = "s3";

/// S3-compatible storage backend
pub struct S3Backend {
    client: S3Client,
    headers: ObjectHeaders,
}

impl S3Backend {
    /// Create a new S3 backend from ambient AWS credentials
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        // Retry policy belongs to whoever wraps the pipeline
        let mut s3_config_builder =
            S3ConfigBuilder::from(&aws_config).retry_config(RetryConfig::disabled());

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 backend initialized"
        );

        Self {
            client,
            headers: ObjectHeaders {
                content_type: "application/octet-stream",
            },
        }
    }

    /// Set the headers stored with every object
    pub fn with_headers(mut self, headers: ObjectHeaders) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn upload(&self, body: Bytes, bucket: &str, key: &str) -> Result<(), UploadError> {
        debug!("Uploading chunk to S3");

        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(self.headers.content_type)
            .body(ByteStream::from(body));

        request.send().await.map_err(|e| {
            UploadError::new(
                BACKEND_NAME,
                bucket,
                key,
                DisplayErrorContext(e).to_string(),
            )
        })?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}
