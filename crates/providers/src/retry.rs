//! Fixed-attempt retry for LLM calls.
//!
//! Vendor failures are assumed rare and short-lived, so a failed call is
//! simply re-issued immediately, up to a fixed number of attempts. Errors
//! that cannot change on retry (no vendor, unsupported mode, bad key) are
//! returned at once.

use async_trait::async_trait;
use parley_core::error::VendorError;
use parley_core::{LlmCompletion, LlmRequest, Vendor};
use std::sync::Arc;
use tracing::{info, warn};

/// A vendor that re-issues failed requests to the wrapped vendor.
pub struct RetryingVendor {
    inner: Arc<dyn Vendor>,
    attempts: u32,
}

impl RetryingVendor {
    /// `attempts` counts the first call; values below 1 are treated as 1.
    pub fn new(inner: Arc<dyn Vendor>, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

fn is_permanent(err: &VendorError) -> bool {
    matches!(
        err,
        VendorError::NoVendorForModel(_)
            | VendorError::UnsupportedMode { .. }
            | VendorError::AuthenticationFailed(_)
    )
}

#[async_trait]
impl Vendor for RetryingVendor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_patterns(&self) -> &[String] {
        self.inner.model_patterns()
    }

    fn supports_prefill(&self) -> bool {
        self.inner.supports_prefill()
    }

    fn max_stop_sequences(&self, model: &str) -> Option<usize> {
        self.inner.max_stop_sequences(model)
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, VendorError> {
        let mut attempt = 1;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => {
                    if attempt > 1 {
                        info!(vendor = self.inner.name(), attempt, "LLM call succeeded after retry");
                    }
                    return Ok(completion);
                }
                Err(e) if is_permanent(&e) || attempt >= self.attempts => return Err(e),
                Err(e) => {
                    warn!(
                        vendor = self.inner.name(),
                        attempt,
                        total = self.attempts,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }
}
