//! Exponential-backoff wrapper for platform I/O.
//!
//! Fetches and sends are retried with doubling delays up to a cap. Errors
//! that retrying cannot fix (a missing message) are returned at once.
//! Typing indicators are best-effort and never retried.

use async_trait::async_trait;
use parley_core::error::PlatformError;
use parley_core::{FetchRequest, FetchedContext, Platform};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy for platform calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first.
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(retry: &parley_config::RetryConfig) -> Self {
        Self {
            attempts: retry.platform_attempts.max(1),
            initial_backoff_ms: retry.platform_initial_backoff_ms,
            max_backoff_ms: retry.platform_max_backoff_ms,
        }
    }
}

/// A platform whose I/O calls are retried with exponential backoff.
pub struct RetryingPlatform {
    inner: Arc<dyn Platform>,
    policy: BackoffPolicy,
}

impl RetryingPlatform {
    pub fn new(inner: Arc<dyn Platform>, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    async fn retry<T, F, Fut>(&self, op: &str, channel_id: &str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut backoff_ms = self.policy.initial_backoff_ms;
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(op, channel_id, attempt, "Platform call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        op,
                        channel_id,
                        attempt,
                        total = attempts,
                        backoff_ms,
                        error = %e,
                        "Platform call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(self.policy.max_backoff_ms);
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Platform for RetryingPlatform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_context(
        &self,
        channel_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedContext, PlatformError> {
        self.retry("fetch_context", channel_id, || {
            self.inner.fetch_context(channel_id, request)
        })
        .await
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Vec<String>, PlatformError> {
        self.retry("send_message", channel_id, || {
            self.inner.send_message(channel_id, text, reply_to)
        })
        .await
    }

    async fn send_attachment(
        &self,
        channel_id: &str,
        filename: &str,
        content: &[u8],
        caption: Option<&str>,
    ) -> Result<Vec<String>, PlatformError> {
        self.retry("send_attachment", channel_id, || {
            self.inner.send_attachment(channel_id, filename, content, caption)
        })
        .await
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), PlatformError> {
        self.retry("delete_message", channel_id, || {
            self.inner.delete_message(channel_id, message_id)
        })
        .await
    }

    async fn start_typing(&self, channel_id: &str) -> Result<(), PlatformError> {
        self.inner.start_typing(channel_id).await
    }

    async fn stop_typing(&self, channel_id: &str) -> Result<(), PlatformError> {
        self.inner.stop_typing(channel_id).await
    }

    async fn send_webhook(
        &self,
        channel_id: &str,
        text: &str,
        display_name: &str,
    ) -> Result<Vec<String>, PlatformError> {
        self.retry("send_webhook", channel_id, || {
            self.inner.send_webhook(channel_id, text, display_name)
        })
        .await
    }
}
