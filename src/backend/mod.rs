//! The generative-backend contract and its implementations.

mod cached;
pub mod llm_output;
mod openai;
mod retry;

pub use cached::CachedBackend;
pub use openai::{OpenAiBackend, OpenAiSettings};
pub use retry::{send_with_retry, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;

use crate::data::{AITestRequest, AITestResponse};
use crate::errors::BackendError;

/// A service that proposes or refines test cases.
///
/// Implementations must honour `timeout` and report failures through the
/// four `BackendError` variants only.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Provider name, used in logs and cache namespaces
    fn name(&self) -> &str;

    fn model(&self) -> &str {
        ""
    }

    async fn send(&self, request: &AITestRequest, timeout: Duration) -> Result<AITestResponse, BackendError>;
}

/// Stands in when no provider is configured; every call fails with `NotConfigured`
#[derive(Debug, Clone)]
pub struct NotConfiguredBackend {
    reason: String,
}

impl NotConfiguredBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl GenerativeBackend for NotConfiguredBackend {
    fn name(&self) -> &str {
        "none"
    }

    async fn send(&self, _request: &AITestRequest, _timeout: Duration) -> Result<AITestResponse, BackendError> {
        Err(BackendError::NotConfigured(self.reason.clone()))
    }
}
