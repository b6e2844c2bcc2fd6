use std::time::Duration;

use tracing::warn;

use super::GenerativeBackend;
use crate::data::{AITestRequest, AITestResponse};
use crate::errors::BackendError;

/// Bounded exponential backoff for transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// min(base * 2^attempt, max)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Sends `request`, retrying rate limits and network errors up to
/// `policy.max_retries` times. A `retry_after` hint replaces the computed
/// delay but is still capped by `max_delay`. Other errors return at once.
pub async fn send_with_retry(
    backend: &dyn GenerativeBackend,
    request: &AITestRequest,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<AITestResponse, BackendError> {
    let mut attempt = 0;
    loop {
        match backend.send(request, timeout).await {
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                let delay = match &error {
                    BackendError::RateLimited {
                        retry_after: Some(after),
                    } => (*after).min(policy.max_delay),
                    _ => policy.delay_for(attempt),
                };
                warn!(
                    provider = backend.name(),
                    section = %request.section_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient backend error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::context_enhancement::{enhance, section_metadata};
    use crate::data::{DomainContext, RequestMode, Section, SectionKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<Vec<BackendError>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl GenerativeBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _request: &AITestRequest, _timeout: Duration) -> Result<AITestResponse, BackendError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(error) => Err(error),
                None => Ok(AITestResponse::default()),
            }
        }
    }

    fn request() -> AITestRequest {
        let section = Section::new("s1", SectionKind::Markup, "x");
        AITestRequest {
            section_id: "s1".to_string(),
            section_kind: SectionKind::Markup,
            section_content: "x".to_string(),
            analysis: Default::default(),
            context: enhance(&DomainContext::default(), &section_metadata(&section)),
            count: None,
            mode: RequestMode::Generate,
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let backend = Flaky {
            failures: Mutex::new(vec![
                BackendError::Network("reset".to_string()),
                BackendError::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                },
            ]),
            calls: Mutex::new(0),
        };
        let result = send_with_retry(&backend, &request(), Duration::from_secs(1), &quick()).await;
        assert!(result.is_ok());
        assert_eq!(*backend.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let backend = Flaky {
            failures: Mutex::new(vec![BackendError::Network("down".to_string()); 5]),
            calls: Mutex::new(0),
        };
        let result = send_with_retry(&backend, &request(), Duration::from_secs(1), &quick()).await;
        assert_eq!(result, Err(BackendError::Network("down".to_string())));
        assert_eq!(*backend.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn not_configured_is_never_retried() {
        let backend = Flaky {
            failures: Mutex::new(vec![BackendError::NotConfigured("no key".to_string())]),
            calls: Mutex::new(0),
        };
        let result = send_with_retry(&backend, &request(), Duration::from_secs(1), &quick()).await;
        assert!(matches!(result, Err(BackendError::NotConfigured(_))));
        assert_eq!(*backend.calls.lock().unwrap(), 1);
    }
}
