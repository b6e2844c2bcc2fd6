use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::GenerativeBackend;
use crate::data::{AITestRequest, AITestResponse, Cache};
use crate::errors::BackendError;

/// Serves repeated requests from a response cache.
///
/// Only successful responses are stored. The key is a hash of the full
/// serialized request, so any change to content, analysis or context misses.
pub struct CachedBackend {
    inner: Arc<dyn GenerativeBackend>,
    cache: Arc<dyn Cache>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn GenerativeBackend>, cache: Arc<dyn Cache>) -> Self {
        Self { inner, cache }
    }

    fn cache_key(request: &AITestRequest) -> Result<String, BackendError> {
        let serialized = serde_json::to_string(request)
            .map_err(|e| BackendError::MalformedResponse(format!("cannot serialize request: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl GenerativeBackend for CachedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn send(&self, request: &AITestRequest, timeout: Duration) -> Result<AITestResponse, BackendError> {
        let key = Self::cache_key(request)?;

        if let Some(hit) = self.cache.get(&key) {
            match serde_json::from_str::<AITestResponse>(&hit) {
                Ok(mut response) => {
                    debug!(section = %request.section_id, key = %key, "response cache hit");
                    response.metadata.cached = true;
                    return Ok(response);
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring unreadable cache entry"),
            }
        }

        let response = self.inner.send(request, timeout).await?;

        match serde_json::to_string(&response) {
            Ok(value) => {
                let cache = Arc::clone(&self.cache);
                let write = tokio::task::spawn_blocking(move || cache.set(&key, &value));
                if let Err(e) = write.await {
                    warn!(error = %e, "cache write task failed");
                }
            }
            Err(e) => warn!(error = %e, "response could not be serialized for caching"),
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::context_enhancement::{enhance, section_metadata};
    use crate::contexts::FileCache;
    use crate::data::{CandidateTest, DomainContext, ProviderMetadata, RequestMode, Section, SectionKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GenerativeBackend for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _request: &AITestRequest, _timeout: Duration) -> Result<AITestResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BackendError::Network("down".to_string()));
            }
            Ok(AITestResponse {
                tests: vec![CandidateTest {
                    name: Some("t".to_string()),
                    ..CandidateTest::default()
                }],
                metadata: ProviderMetadata {
                    provider: "counting".to_string(),
                    ..ProviderMetadata::default()
                },
            })
        }
    }

    fn request(content: &str) -> AITestRequest {
        let section = Section::new("s1", SectionKind::Markup, content);
        AITestRequest {
            section_id: "s1".to_string(),
            section_kind: SectionKind::Markup,
            section_content: content.to_string(),
            analysis: Default::default(),
            context: enhance(&DomainContext::default(), &section_metadata(&section)),
            count: None,
            mode: RequestMode::Generate,
        }
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = Arc::new(FileCache::new(Some(dir.path().to_path_buf()), "ns".to_string()));
        let backend = CachedBackend::new(inner.clone(), cache);

        let first = backend.send(&request("A"), Duration::from_secs(1)).await.unwrap();
        assert!(!first.metadata.cached);
        let second = backend.send(&request("A"), Duration::from_secs(1)).await.unwrap();
        assert!(second.metadata.cached);
        assert_eq!(second.tests, first.tests);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        backend.send(&request("B"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = Arc::new(FileCache::new(Some(dir.path().to_path_buf()), "ns".to_string()));
        let backend = CachedBackend::new(inner.clone(), cache);

        assert!(backend.send(&request("A"), Duration::from_secs(1)).await.is_err());
        assert!(backend.send(&request("A"), Duration::from_secs(1)).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
