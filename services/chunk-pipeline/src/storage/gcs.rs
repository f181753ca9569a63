use super::{ObjectHeaders, StorageBackend, UploadError};
use crate::config::GcsConfig;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload, RetryConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const BACKEND_NAME: &str = "gcs";

/// Google Cloud Storage backend.
///
/// object_store clients are bound to a single bucket, so one is built per
/// bucket on first use and cached.
pub struct GcsBackend {
    config: GcsConfig,
    headers: ObjectHeaders,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl GcsBackend {
    pub fn new(config: GcsConfig) -> Self {
        Self {
            config,
            headers: ObjectHeaders {
                content_type: "application/octet-stream",
            },
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Set the headers stored with every object
    pub fn with_headers(mut self, headers: ObjectHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Get or build the client for `bucket`
    pub fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, object_store::Error> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .with_retry(RetryConfig {
                max_retries: 0,
                ..Default::default()
            });

        if let Some(ref key) = self.config.credentials_json {
            debug!("Constructing GCS client with service account key");
            builder = builder.with_service_account_key(key);
        } else if let Some(ref path) = self.config.credentials_path {
            debug!(path = %path, "Constructing GCS client with service account file");
            builder = builder.with_service_account_path(path);
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        stores.insert(bucket.to_string(), store.clone());

        info!(bucket = %bucket, "GCS client initialized");

        Ok(store)
    }

    fn attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, self.headers.content_type.into());
        attributes
    }
}

/// Object path for `key`, refusing keys object_store would store under a
/// different name (empty segments, a leading `/`, `.`/`..` or control
/// characters)
fn object_path(key: &str) -> Result<Path, Box<dyn std::error::Error + Send + Sync>> {
    let path = Path::parse(key)?;
    if path.as_ref() != key {
        return Err(format!("key would be stored as {:?}", path.as_ref()).into());
    }
    Ok(path)
}

#[async_trait]
impl StorageBackend for GcsBackend {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn upload(&self, body: Bytes, bucket: &str, key: &str) -> Result<(), UploadError> {
        let path = object_path(key).map_err(|e| UploadError::new(BACKEND_NAME, bucket, key, e))?;
        let store = self
            .store_for(bucket)
            .map_err(|e| UploadError::new(BACKEND_NAME, bucket, key, e))?;

        debug!("Uploading chunk to GCS");

        let options = PutOptions {
            attributes: self.attributes(),
            ..Default::default()
        };

        store
            .put_opts(&path, PutPayload::from(body), options)
            .await
            .map_err(|e| UploadError::new(BACKEND_NAME, bucket, key, e))?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}
