use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info, warn};

use super::llm_output::parse_candidates;
use super::GenerativeBackend;
use crate::contexts::prompt_template::populate;
use crate::data::{AITestRequest, AITestResponse, ProviderMetadata};
use crate::errors::BackendError;
use crate::registries::PromptRegistry;

pub const PROVIDER_NAME: &str = "openai";

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub model: String,
    pub base_url: String,
    /// `None` when the configured key variable is unset
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Chat-completions client for any OpenAI-compatible endpoint
pub struct OpenAiBackend {
    client: reqwest::Client,
    settings: OpenAiSettings,
    prompts: Arc<dyn PromptRegistry>,
}

impl OpenAiBackend {
    pub fn new(settings: OpenAiSettings, prompts: Arc<dyn PromptRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            prompts,
        }
    }

    fn endpoint(&self) -> String {
        if self.settings.base_url.ends_with('/') {
            format!("{}chat/completions", self.settings.base_url)
        } else {
            format!("{}/chat/completions", self.settings.base_url)
        }
    }

    fn system_prompt(&self, request: &AITestRequest) -> Result<String, BackendError> {
        let name = request.mode.prompt_name();
        self.prompts
            .get_prompt(name)
            .and_then(|template| populate(&template, request))
            .map_err(|e| BackendError::NotConfigured(format!("prompt '{}': {}", name, e)))
    }

    async fn complete(&self, api_key: &str, system: &str, user: &str) -> Result<String, BackendError> {
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
        });
        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.settings.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &text));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(format!("body is not JSON: {}", e)))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::MalformedResponse("missing choices[0].message.content".to_string()))
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::NotConfigured(format!("API rejected credentials ({})", status))
        }
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => BackendError::Network(format!("API request timed out ({})", status)),
        s if s.is_server_error() => BackendError::Network(format!("API error ({}): {}", s, body)),
        s => BackendError::NotConfigured(format!("API error ({}): {}", s, body)),
    }
}

#[async_trait]
impl GenerativeBackend for OpenAiBackend {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn send(&self, request: &AITestRequest, timeout: Duration) -> Result<AITestResponse, BackendError> {
        let api_key = self.settings.api_key.as_deref().ok_or_else(|| {
            BackendError::NotConfigured(format!(
                "environment variable {} is not set",
                self.settings.api_key_env
            ))
        })?;

        let system = self.system_prompt(request)?;
        let user = serde_json::to_string_pretty(request)
            .map_err(|e| BackendError::MalformedResponse(format!("cannot serialize request: {}", e)))?;

        debug!(
            provider = PROVIDER_NAME,
            model = %self.settings.model,
            section = %request.section_id,
            mode = request.mode.prompt_name(),
            "sending request"
        );
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.complete(api_key, &system, &user)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Network(format!(
                "request timed out after {} ms",
                timeout.as_millis()
            ))),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let content = match outcome {
            Ok(content) => content,
            Err(e) => {
                warn!(provider = PROVIDER_NAME, model = %self.settings.model, latency_ms, error = %e, "backend call failed");
                return Err(e);
            }
        };

        let tests = parse_candidates(&content)?;
        info!(
            provider = PROVIDER_NAME,
            model = %self.settings.model,
            latency_ms,
            candidates = tests.len(),
            "backend call succeeded"
        );
        Ok(AITestResponse {
            tests,
            metadata: ProviderMetadata {
                provider: PROVIDER_NAME.to_string(),
                model: self.settings.model.clone(),
                latency_ms,
                cached: false,
            },
        })
    }
}
