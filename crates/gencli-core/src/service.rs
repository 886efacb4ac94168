//! Contract with the external generation service, plus the retry and
//! cancellation plumbing every call goes through.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{MAX_BACKOFF_MS, UploadState};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("Rate limited by the generation service")]
    RateLimited,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Content error: {0}")]
    Content(String),

    #[error("Upload error: {0}")]
    Upload(String),
}

impl ServiceError {
    /// Map a non-success HTTP status. Only 429 is treated as transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 429 {
            Self::RateLimited
        } else {
            Self::Http {
                status,
                message: message.into(),
            }
        }
    }

    /// True for the "too many requests" condition; the only retried failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Cooperative cancellation shared between a caller and an in-flight call.
///
/// Raising the flag does not stop anything by itself; long calls check it at
/// their next checkpoint and return [`ServiceError::Cancelled`]. A call that
/// finishes anyway has its result discarded by whoever raised the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Checkpoint: `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<(), ServiceError> {
        if self.is_cancelled() {
            Err(ServiceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Processing state of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Ready,
    Processing,
    Failed,
}

/// One piece of a description request.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Reference to previously uploaded content
    File { uri: String, mime_type: String },
}

/// Everything the service needs to describe one file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescribeRequest {
    pub parts: Vec<Part>,
}

impl DescribeRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Text(prompt.into())],
        }
    }

    /// Request referencing an upload, followed by the instruction text.
    pub fn with_upload(upload: &UploadState, prompt: impl Into<String>) -> Self {
        Self {
            parts: vec![
                Part::File {
                    uri: upload.uri.clone(),
                    mime_type: upload.mime_type.clone(),
                },
                Part::Text(prompt.into()),
            ],
        }
    }

    /// Concatenated text parts (handy for logging and tests).
    pub fn prompt_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::File { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The external text/vision model service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Natural-language description for a prepared request.
    async fn describe(
        &self,
        request: &DescribeRequest,
        cancel: &CancelFlag,
    ) -> Result<String, ServiceError>;

    /// Embedding vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;

    /// Hand a file's bytes to the service.
    async fn upload(
        &self,
        path: &Path,
        mime_type: &str,
        cancel: &CancelFlag,
    ) -> Result<UploadState, ServiceError>;

    /// Whether an upload can be referenced yet.
    async fn upload_status(&self, handle: &str) -> Result<UploadStatus, ServiceError>;
}

/// Exponential backoff for rate-limited calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: base_delay.max(Duration::from_millis(1)),
        }
    }

    /// Delay before retry `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }

    /// Every delay this policy can produce, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for_retry(retry))
    }
}

/// Run `op`, retrying with backoff while it reports rate limiting.
///
/// Any other failure returns at once. After `max_retries` retries the last
/// rate-limit error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut retry = 0;
    loop {
        cancel.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limited() && retry < policy.max_retries => {
                let delay = policy.delay_for_retry(retry);
                tracing::debug!("Rate limited, retry {} in {:?}", retry + 1, delay);
                sleep_with_cancellation(cancel, delay).await?;
                retry += 1;
            }
            Err(err) => {
                if err.is_rate_limited() {
                    tracing::warn!("Still rate limited after {} retries", retry);
                }
                return Err(err);
            }
        }
    }
}

/// Sleep for `delay`, waking every 100ms to honor `cancel`.
pub async fn sleep_with_cancellation(
    cancel: &CancelFlag,
    delay: Duration,
) -> Result<(), ServiceError> {
    let started = tokio::time::Instant::now();
    while started.elapsed() < delay {
        cancel.check()?;
        let remaining = delay.saturating_sub(started.elapsed());
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
    cancel.check()
}
