//! Configuration for the chunk pipeline.
//!
//! Raw settings are loaded in layers (defaults, optional files, `PIPELINE__*`
//! environment variables) into [`Config`]. [`PipelineSettings`] is the
//! validated form the uploader runs on: the storage URL split into bucket and
//! key template, and the compression and format choices inferred from the
//! key's suffix unless explicitly overridden.

use crate::chunk_uploader::FailurePolicy;
use crate::encoder::{ChunkFormat, EncoderOptions};
use crate::key_template::{KeyTemplate, TemplateError};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid storage URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported storage scheme '{0}' (expected s3:// or gs://)")]
    UnsupportedScheme(String),

    #[error("Invalid key template: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to initialize storage backend: {0}")]
    Backend(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the pipeline service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Chunking and upload configuration
    pub pipeline: PipelineConfig,
    /// S3 client configuration
    #[serde(default)]
    pub s3: S3Config,
    /// GCS client configuration
    #[serde(default)]
    pub gcs: GcsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Named attributes published to key templates, e.g. `name`
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Chunking and upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Storage URL: `<scheme>://<bucket>/<key-template>`
    pub url: String,
    /// Records per chunk
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Gzip override; inferred from a `.gz` key suffix when unset
    #[serde(default)]
    pub gzip: Option<bool>,
    /// Seconds without a new record before a partial chunk is flushed
    #[serde(default = "default_max_wait_upload_time")]
    pub max_wait_upload_time: f64,
    /// Format override; inferred from the key extension when unset
    #[serde(default)]
    pub format: Option<ChunkFormat>,
    /// Options passed through to the encoder
    #[serde(default)]
    pub export: EncoderOptions,
    /// Extra upload attempts for a failed chunk before it is dropped
    #[serde(default)]
    pub upload_retries: u32,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// GCS client configuration.
///
/// Without explicit credentials the client falls back to the
/// `GOOGLE_*` environment the process runs in.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GcsConfig {
    /// Service account key as a JSON document
    pub credentials_json: Option<String>,
    /// Path to a service account key file
    pub credentials_path: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "chunk-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_chunk_size() -> usize {
    100
}

fn default_max_wait_upload_time() -> f64 {
    30.0
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            // Add config file if present
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/chunk-pipeline/pipeline").required(false))
            // Override with environment variables
            // PIPELINE__PIPELINE__URL -> pipeline.url
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            attributes: HashMap::new(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl PipelineConfig {
    /// A configuration for `url` with every other setting at its default
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_chunk_size: default_max_chunk_size(),
            gzip: None,
            max_wait_upload_time: default_max_wait_upload_time(),
            format: None,
            export: EncoderOptions::default(),
            upload_retries: 0,
        }
    }
}

/// Storage provider selected by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScheme {
    S3,
    Gcs,
}

impl StorageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScheme::S3 => "s3",
            StorageScheme::Gcs => "gs",
        }
    }
}

/// A storage URL split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub scheme: StorageScheme,
    pub bucket: String,
    /// Everything after the bucket, verbatim
    pub key_template: String,
}

const STORAGE_URL: &str = r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?P<bucket>[^/]*)(/(?P<key>.*))?$";

fn storage_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(STORAGE_URL).expect("storage URL pattern is valid"))
}

impl StorageUrl {
    /// Parse `<scheme>://<bucket>/<key-template>`.
    ///
    /// The key template is kept as written: braces and other characters are
    /// not percent-decoded.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let captures = storage_url_pattern()
            .captures(url)
            .ok_or_else(|| invalid("expected <scheme>://<bucket>/<key-template>"))?;

        let scheme = match captures.name("scheme").map(|m| m.as_str().to_ascii_lowercase()) {
            Some(s) if s == "s3" || s == "s3a" => StorageScheme::S3,
            Some(s) if s == "gs" || s == "gcs" => StorageScheme::Gcs,
            Some(other) => return Err(ConfigError::UnsupportedScheme(other)),
            None => return Err(invalid("missing scheme")),
        };

        let bucket = captures.name("bucket").map(|m| m.as_str()).unwrap_or_default();
        if bucket.is_empty() {
            return Err(invalid("missing bucket name"));
        }

        let key_template = captures.name("key").map(|m| m.as_str()).unwrap_or_default();
        if key_template.is_empty() {
            return Err(invalid("missing object key template"));
        }

        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            key_template: key_template.to_string(),
        })
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme.as_str(), self.bucket, self.key_template)
    }
}

const GZIP_SUFFIX: &str = ".gz";

/// Validated settings the uploader runs on
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub url: StorageUrl,
    pub template: KeyTemplate,
    pub max_chunk_size: usize,
    pub use_gzip: bool,
    pub max_wait: Duration,
    pub format: ChunkFormat,
    pub export: EncoderOptions,
    pub failure_policy: FailurePolicy,
}

impl PipelineSettings {
    /// Derive settings from raw configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let url = StorageUrl::parse(&config.url)?;
        let template = KeyTemplate::parse(&url.key_template)?;

        if config.max_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.max_chunk_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let max_wait = positive_duration(config.max_wait_upload_time).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "pipeline.max_wait_upload_time".to_string(),
                message: format!(
                    "must be a positive number of seconds, got {}",
                    config.max_wait_upload_time
                ),
            }
        })?;

        let use_gzip = config
            .gzip
            .unwrap_or_else(|| url.key_template.ends_with(GZIP_SUFFIX));
        let format = config
            .format
            .unwrap_or_else(|| infer_format(&url.key_template));

        let failure_policy = match config.upload_retries {
            0 => FailurePolicy::Drop,
            attempts => FailurePolicy::Retry { attempts },
        };

        Ok(Self {
            url,
            template,
            max_chunk_size: config.max_chunk_size,
            use_gzip,
            max_wait,
            format,
            export: config.export.clone(),
            failure_policy,
        })
    }
}

fn positive_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Format implied by the key's extension once any `.gz` is removed
fn infer_format(key_template: &str) -> ChunkFormat {
    let key = key_template.strip_suffix(GZIP_SUFFIX).unwrap_or(key_template);
    let file_name = key.rsplit('/').next().unwrap_or(key);

    match file_name.rsplit_once('.') {
        Some((_, extension)) => ChunkFormat::from_extension(extension),
        None => ChunkFormat::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "{name}/{time}/items.{chunk:07d}";

    fn settings(url: &str) -> PipelineSettings {
        PipelineSettings::from_config(&PipelineConfig::new(url)).unwrap()
    }

    #[test]
    fn test_s3() {
        let settings = settings(&format!("s3://my-bucket/{TEMPLATE}.jl.gz"));

        assert_eq!(settings.url.scheme, StorageScheme::S3);
        assert_eq!(settings.url.bucket, "my-bucket");
        assert_eq!(settings.template.as_str(), "{name}/{time}/items.{chunk:07d}.jl.gz");
        assert_eq!(settings.max_chunk_size, 100);
        assert!(settings.use_gzip);
        assert_eq!(settings.max_wait, Duration::from_secs(30));
        assert_eq!(settings.format, ChunkFormat::JsonLines);
        assert_eq!(settings.failure_policy, FailurePolicy::Drop);
    }

    #[test]
    fn test_gcs() {
        let settings = settings(&format!("gs://my-bucket/{TEMPLATE}.jl"));

        assert_eq!(settings.url.scheme, StorageScheme::Gcs);
        assert_eq!(settings.url.bucket, "my-bucket");
        assert_eq!(settings.template.as_str(), "{name}/{time}/items.{chunk:07d}.jl");
        assert!(!settings.use_gzip);
        assert_eq!(settings.format, ChunkFormat::JsonLines);
    }

    #[test]
    fn test_json() {
        let settings = settings(&format!("s3://my-bucket/{TEMPLATE}.json"));
        assert!(!settings.use_gzip);
        assert_eq!(settings.format, ChunkFormat::Json);
    }

    #[test]
    fn test_json_gz() {
        let settings = settings(&format!("s3://my-bucket/{TEMPLATE}.json.gz"));
        assert!(settings.use_gzip);
        assert_eq!(settings.format, ChunkFormat::Json);
    }

    #[test]
    fn test_force_gzip() {
        let mut config = PipelineConfig::new(format!("s3://my-bucket/{TEMPLATE}.jl"));
        config.gzip = Some(true);
        assert!(PipelineSettings::from_config(&config).unwrap().use_gzip);
    }

    #[test]
    fn test_force_no_gzip() {
        let mut config = PipelineConfig::new(format!("s3://my-bucket/{TEMPLATE}.jl.gz"));
        config.gzip = Some(false);
        assert!(!PipelineSettings::from_config(&config).unwrap().use_gzip);
    }

    #[test]
    fn test_format_override() {
        let mut config = PipelineConfig::new(format!("s3://my-bucket/{TEMPLATE}.jl"));
        config.format = Some(ChunkFormat::Json);
        assert_eq!(PipelineSettings::from_config(&config).unwrap().format, ChunkFormat::Json);
    }

    #[test]
    fn test_max_chunk_size_and_wait() {
        let mut config = PipelineConfig::new(format!("s3://my-bucket/{TEMPLATE}.jl.gz"));
        config.max_chunk_size = 1000;
        config.max_wait_upload_time = 300.0;
        config.upload_retries = 2;

        let settings = PipelineSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_chunk_size, 1000);
        assert_eq!(settings.max_wait, Duration::from_secs(300));
        assert_eq!(settings.failure_policy, FailurePolicy::Retry { attempts: 2 });
    }

    #[test]
    fn test_fractional_wait() {
        let mut config = PipelineConfig::new("s3://b/items.{chunk}.jl");
        config.max_wait_upload_time = 0.25;
        let settings = PipelineSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_wait, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = PipelineConfig::new("s3://b/items.{chunk}.jl");
        config.max_chunk_size = 0;
        assert!(matches!(
            PipelineSettings::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));

        for wait in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut config = PipelineConfig::new("s3://b/items.{chunk}.jl");
            config.max_wait_upload_time = wait;
            assert!(matches!(
                PipelineSettings::from_config(&config),
                Err(ConfigError::InvalidValue { .. })
            ));
        }
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            StorageUrl::parse("ftp://my-bucket/items.jl"),
            Err(ConfigError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn test_malformed_urls() {
        for url in ["my-bucket/items.jl", "s3://", "s3:///items.jl", "s3://my-bucket", "s3://my-bucket/"] {
            assert!(
                matches!(StorageUrl::parse(url), Err(ConfigError::InvalidUrl { .. })),
                "expected InvalidUrl for {url}"
            );
        }
    }

    #[test]
    fn test_malformed_template_fails_at_configure_time() {
        let config = PipelineConfig::new("s3://my-bucket/items.{chunk.jl");
        assert!(matches!(
            PipelineSettings::from_config(&config),
            Err(ConfigError::Template(_))
        ));
    }

    #[test]
    fn test_unknown_placeholder_passes_configure() {
        assert!(PipelineSettings::from_config(&PipelineConfig::new("s3://b/{nonexistent}.jl")).is_ok());
    }

    #[test]
    fn test_infer_format_ignores_dots_in_directories() {
        assert_eq!(infer_format("v1.json/items"), ChunkFormat::JsonLines);
        assert_eq!(infer_format("out/items.{chunk}.json"), ChunkFormat::Json);
        assert_eq!(infer_format("out/items.gz"), ChunkFormat::JsonLines);
    }

    #[test]
    fn test_storage_url_display() {
        let url = StorageUrl::parse("s3a://my-bucket/a/{chunk}.jl").unwrap();
        assert_eq!(url.to_string(), "s3://my-bucket/a/{chunk}.jl");
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_chunk_size(), 100);
        assert_eq!(default_max_wait_upload_time(), 30.0);
        assert_eq!(S3Config::default().region, "us-east-1");
    }
}
