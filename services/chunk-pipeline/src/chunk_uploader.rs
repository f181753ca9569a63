//! Chunk buffering and flush coordination.
//!
//! [`ChunkUploader`] accumulates submitted records and uploads them as one
//! object per chunk. A chunk closes when it reaches `max_chunk_size` records,
//! when no record has arrived for `max_wait`, or when the uploader is closed.
//!
//! All state (buffer, chunk offset, deadline timer) sits behind a single async
//! mutex. `submit`, the deadline task and `close` each take that lock for the
//! whole of "cancel timer / append / check threshold / flush", so a deadline
//! firing mid-submit can never see a half-updated buffer and no record is
//! flushed twice. Each armed deadline carries a generation number; a deadline
//! that lost the race to a newer submission finds its generation stale and
//! does nothing.

use crate::config::{ConfigError, PipelineSettings};
use crate::encoder::{self, EncodeError};
use crate::key_template::{TemplateError, TemplateParams, TemplateValue};
use crate::storage::{StorageBackend, UploadError};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Metric name for successful chunk uploads
pub const UPLOAD_SUCCESS_COUNTER: &str = "pipeline.upload.success";
/// Metric name for failed chunk flushes
pub const UPLOAD_FAILURE_COUNTER: &str = "pipeline.upload.fail";

/// Placeholder bound to the chunk offset
const CHUNK_PARAM: &str = "chunk";
/// Placeholder bound to the session timestamp
const TIME_PARAM: &str = "time";

/// Errors surfaced by the uploader
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to resolve object key: {0}")]
    Template(#[from] TemplateError),

    #[error("Failed to encode chunk: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Uploader has not been opened")]
    NotOpen,

    #[error("Uploader is already open")]
    AlreadyOpen,

    #[error("Uploader has been closed")]
    Closed,
}

/// What to do when a chunk upload fails.
///
/// Either way the chunk is dropped once the policy is exhausted, so a
/// persistent failure can never wedge the pipeline on the same records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Give up after the first failed attempt
    #[default]
    Drop,
    /// Re-send the same bytes up to `attempts` more times
    Retry { attempts: u32 },
}

impl FailurePolicy {
    fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::Drop => 1,
            FailurePolicy::Retry { attempts } => attempts.saturating_add(1),
        }
    }
}

/// Caller-supplied context captured when the uploader is opened
#[derive(Debug, Clone)]
pub struct SessionContext {
    attributes: TemplateParams,
    /// Fixed start time; stamped by `open` when unset
    started_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    /// A session with no attributes, starting whenever it is opened
    pub fn new() -> Self {
        Self {
            attributes: TemplateParams::new(),
            started_at: None,
        }
    }

    /// Publish a named attribute to key templates
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<TemplateValue>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Override the session start time
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at.trunc_subsecs(0));
        self
    }

    /// Bind the attributes and the session time, stamping now if no start
    /// time was given
    fn into_params(self) -> TemplateParams {
        let started_at = self
            .started_at
            .unwrap_or_else(|| Utc::now().trunc_subsecs(0));
        let mut params = self.attributes;
        params.insert(
            TIME_PARAM.to_string(),
            TemplateValue::Text(format_timestamp(started_at)),
        );
        params
    }
}

/// Session timestamp as used in keys: ISO 8601 with `-` instead of `:`
fn format_timestamp(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y-%m-%dT%H-%M-%S").to_string()
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic upload counters, mirrored to the `metrics` recorder
#[derive(Debug, Default)]
pub struct UploadStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl UploadStats {
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(UPLOAD_SUCCESS_COUNTER).increment(1);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(UPLOAD_FAILURE_COUNTER).increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Open,
    Closed,
}

struct ChunkState<T> {
    items: Vec<T>,
    /// Records flushed in all previous chunks
    chunk_offset: u64,
    lifecycle: Lifecycle,
    params: TemplateParams,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl<T> ChunkState<T> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // Invalidate a deadline that already woke and is waiting on the lock
        self.timer_generation = self.timer_generation.wrapping_add(1);
    }
}

struct Inner<T> {
    settings: PipelineSettings,
    backend: Arc<dyn StorageBackend>,
    state: Mutex<ChunkState<T>>,
    stats: UploadStats,
}

/// Buffers records into chunks and uploads each chunk as one object
pub struct ChunkUploader<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ChunkUploader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ChunkUploader<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(settings: PipelineSettings, backend: Arc<dyn StorageBackend>) -> Self {
        info!(
            url = %settings.url,
            backend = backend.name(),
            max_chunk_size = settings.max_chunk_size,
            max_wait_secs = settings.max_wait.as_secs_f64(),
            gzip = settings.use_gzip,
            format = ?settings.format,
            "Chunk uploader configured"
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                backend,
                state: Mutex::new(ChunkState {
                    items: Vec::new(),
                    chunk_offset: 0,
                    lifecycle: Lifecycle::Created,
                    params: TemplateParams::new(),
                    timer: None,
                    timer_generation: 0,
                }),
                stats: UploadStats::default(),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> &UploadStats {
        &self.inner.stats
    }

    /// Records flushed so far, whether or not their upload succeeded
    pub async fn chunk_offset(&self) -> u64 {
        self.inner.state.lock().await.chunk_offset
    }

    /// Records waiting in the active chunk
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    /// Start a session. Must be called once before any `submit`.
    pub async fn open(&self, context: SessionContext) -> Result<(), PipelineError> {
        let mut state = self.inner.state.lock().await;
        match state.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Open => return Err(PipelineError::AlreadyOpen),
            Lifecycle::Closed => return Err(PipelineError::Closed),
        }

        let params = context.into_params();
        if let Some(time) = params.get(TIME_PARAM) {
            info!(time = %time, "Chunk uploader opened");
        }

        state.params = params;
        state.lifecycle = Lifecycle::Open;
        Ok(())
    }

    /// Add a record to the active chunk and hand it back.
    ///
    /// Flushes in place once the chunk is full; otherwise (re)arms the flush
    /// deadline. A failed flush is returned here, after the chunk has been
    /// discarded.
    pub async fn submit(&self, item: T) -> Result<T, PipelineError> {
        let mut state = self.inner.state.lock().await;
        match state.lifecycle {
            Lifecycle::Open => {}
            Lifecycle::Created => return Err(PipelineError::NotOpen),
            Lifecycle::Closed => return Err(PipelineError::Closed),
        }

        state.cancel_timer();
        state.items.push(item.clone());

        if state.items.len() >= self.inner.settings.max_chunk_size {
            self.inner.flush(&mut state).await?;
        } else {
            self.arm_timer(&mut state);
        }

        Ok(item)
    }

    /// Flush whatever is buffered and stop. Waits for an in-flight flush first.
    pub async fn close(&self) -> Result<(), PipelineError> {
        let mut state = self.inner.state.lock().await;
        match state.lifecycle {
            Lifecycle::Open => {}
            Lifecycle::Created => return Err(PipelineError::NotOpen),
            Lifecycle::Closed => return Err(PipelineError::Closed),
        }

        let result = self.inner.flush(&mut state).await;
        state.cancel_timer();
        state.lifecycle = Lifecycle::Closed;

        info!(
            chunk_offset = state.chunk_offset,
            succeeded = self.inner.stats.succeeded(),
            failed = self.inner.stats.failed(),
            "Chunk uploader closed"
        );

        result
    }

    fn arm_timer(&self, state: &mut ChunkState<T>) {
        let generation = state.timer_generation;
        let delay = self.inner.settings.max_wait;
        let inner = Arc::clone(&self.inner);

        debug!(
            buffered = state.items.len(),
            delay_secs = delay.as_secs_f64(),
            "Flush deadline armed"
        );

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_on_deadline(generation).await;
        }));
    }
}

impl<T: Serialize> Inner<T> {
    async fn flush_on_deadline(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.timer_generation != generation || state.lifecycle != Lifecycle::Open {
            return;
        }
        // Our own handle; the task is already running
        state.timer = None;

        debug!(buffered = state.items.len(), "Flush deadline reached");

        // No caller to hand the error to: it is logged and counted instead
        if let Err(e) = self.flush(&mut state).await {
            warn!(error = %e, "Deadline flush failed");
        }
    }

    /// Upload the active chunk, then start a new one.
    ///
    /// The offset advances and the buffer clears whatever the outcome.
    #[instrument(
        skip(self, state),
        fields(
            bucket = %self.settings.url.bucket,
            chunk_offset = state.chunk_offset,
            records = state.items.len()
        )
    )]
    async fn flush(&self, state: &mut ChunkState<T>) -> Result<(), PipelineError> {
        if state.items.is_empty() {
            return Ok(());
        }

        let result = self.upload_chunk(state).await;

        state.chunk_offset += state.items.len() as u64;
        state.items.clear();

        match result {
            Ok(key) => {
                self.stats.record_success();
                info!(key = %key, "Chunk uploaded");
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure();
                error!(error = %e, "Chunk flush failed, records dropped");
                Err(e)
            }
        }
    }

    async fn upload_chunk(&self, state: &ChunkState<T>) -> Result<String, PipelineError> {
        let settings = &self.settings;

        let body = encoder::encode(&state.items, settings.format, settings.use_gzip, &settings.export)?;

        let mut params = state.params.clone();
        params.insert(CHUNK_PARAM.to_string(), state.chunk_offset.into());
        let key = settings.template.resolve(&params)?;

        let max_attempts = settings.failure_policy.max_attempts();
        let mut attempt = 1;
        loop {
            match self
                .backend
                .upload(body.clone(), &settings.url.bucket, &key)
                .await
            {
                Ok(()) => return Ok(key),
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Chunk upload failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.items.is_empty() {
            error!(
                records = state.items.len(),
                chunk_offset = state.chunk_offset,
                "Chunk uploader dropped with unflushed records"
            );
        }
    }
}
