use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use yaml_rust::Yaml;

use super::prompt_registry::{PromptRegistry, GENERATE_TESTS, REFINE_TEST};
use crate::backend::{
    CachedBackend, GenerativeBackend, NotConfiguredBackend, OpenAiBackend, OpenAiSettings, RetryPolicy,
};
use crate::contexts::{FileCache, DEFAULT_CACHE_FOLDER, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_CONCURRENCY};
use crate::errors::ConfigError;
use crate::snippet::Budget;

pub const DEFAULT_CONFIG_PATH: &str = "dyntest.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSettings {
    pub max_concurrency: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub folder: PathBuf,
}

/// Project configuration loaded from `dyntest.yml`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub batch: BatchSettings,
    pub history_capacity: usize,
    pub evaluation: Budget,
    pub cache: CacheSettings,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "DYNTEST_API_KEY".to_string(),
            timeout: Duration::from_secs(60),
            max_tokens: None,
            temperature: None,
            batch: BatchSettings {
                max_concurrency: DEFAULT_MAX_CONCURRENCY,
                max_retries: 2,
            },
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            evaluation: Budget::default(),
            cache: CacheSettings {
                enabled: true,
                folder: PathBuf::from(DEFAULT_CACHE_FOLDER),
            },
        }
    }
}

impl ProjectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.batch.max_retries,
            ..RetryPolicy::default()
        }
    }
}

/// File-based project configuration.
/// A missing file yields the defaults; unknown keys are ignored.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    config_path: PathBuf,
}

impl ProviderRegistry {
    /// # Arguments
    /// * `config_path` - Optional path to the configuration file (defaults to "dyntest.yml")
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        }
    }

    pub fn load(&self) -> Result<ProjectConfig, ConfigError> {
        if !self.config_path.exists() {
            debug!(path = %self.config_path.display(), "no configuration file, using defaults");
            return Ok(ProjectConfig::default());
        }

        let content = fs::read_to_string(&self.config_path).map_err(|e| ConfigError::Read {
            path: self.config_path.display().to_string(),
            message: e.to_string(),
        })?;

        parse_config(&content)
    }
}

/// Parses the YAML configuration on top of the defaults
fn parse_config(yaml_content: &str) -> Result<ProjectConfig, ConfigError> {
    use yaml_rust::YamlLoader;

    let docs = YamlLoader::load_from_str(yaml_content)
        .map_err(|e| ConfigError::Invalid(format!("Invalid configuration YAML: {}", e)))?;

    let mut config = ProjectConfig::default();
    let Some(doc) = docs.first() else {
        return Ok(config);
    };
    if doc.is_null() {
        return Ok(config);
    }
    if doc.as_hash().is_none() {
        return Err(ConfigError::Invalid("top level must be a mapping".to_string()));
    }

    if let Some(provider) = doc["provider"].as_str() {
        config.provider = match provider.trim().to_lowercase().as_str() {
            "openai" => ProviderKind::OpenAi,
            "none" | "" => ProviderKind::None,
            other => return Err(ConfigError::Invalid(format!("unknown provider '{}'", other))),
        };
    }
    if let Some(model) = doc["model"].as_str() {
        config.model = model.to_string();
    }
    if let Some(base_url) = doc["base_url"].as_str() {
        config.base_url = base_url.to_string();
    }
    if let Some(api_key_env) = doc["api_key_env"].as_str() {
        config.api_key_env = api_key_env.to_string();
    }
    if let Some(secs) = positive(&doc["timeout_secs"], "timeout_secs")? {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(max_tokens) = positive(&doc["max_tokens"], "max_tokens")? {
        config.max_tokens = Some(to_u32(max_tokens, "max_tokens")?);
    }
    match &doc["temperature"] {
        Yaml::Real(_) | Yaml::Integer(_) => config.temperature = as_f64(&doc["temperature"]).map(|t| t as f32),
        Yaml::BadValue | Yaml::Null => {}
        _ => return Err(ConfigError::Invalid("temperature must be a number".to_string())),
    }

    let batch = &doc["batch"];
    if let Some(n) = positive(&batch["max_concurrency"], "batch.max_concurrency")? {
        config.batch.max_concurrency = n as usize;
    }
    if let Some(n) = non_negative(&batch["max_retries"], "batch.max_retries")? {
        config.batch.max_retries = to_u32(n, "batch.max_retries")?;
    }

    if let Some(n) = positive(&doc["history"]["capacity"], "history.capacity")? {
        config.history_capacity = n as usize;
    }

    let evaluation = &doc["evaluation"];
    if let Some(n) = positive(&evaluation["max_steps"], "evaluation.max_steps")? {
        config.evaluation.max_steps = n;
    }
    if let Some(ms) = positive(&evaluation["timeout_ms"], "evaluation.timeout_ms")? {
        config.evaluation.timeout = Duration::from_millis(ms);
    }

    let cache = &doc["cache"];
    if let Some(enabled) = cache["enabled"].as_bool() {
        config.cache.enabled = enabled;
    }
    if let Some(folder) = cache["folder"].as_str() {
        config.cache.folder = PathBuf::from(folder);
    }

    Ok(config)
}

fn non_negative(value: &Yaml, key: &str) -> Result<Option<u64>, ConfigError> {
    match value {
        Yaml::Integer(n) if *n >= 0 => Ok(Some(*n as u64)),
        Yaml::BadValue | Yaml::Null => Ok(None),
        _ => Err(ConfigError::Invalid(format!("{} must be a non-negative integer", key))),
    }
}

fn positive(value: &Yaml, key: &str) -> Result<Option<u64>, ConfigError> {
    match non_negative(value, key) {
        Ok(Some(0)) | Err(_) => Err(ConfigError::Invalid(format!("{} must be a positive integer", key))),
        other => other,
    }
}

fn to_u32(n: u64, key: &str) -> Result<u32, ConfigError> {
    u32::try_from(n).map_err(|_| ConfigError::Invalid(format!("{} is too large", key)))
}

fn as_f64(value: &Yaml) -> Option<f64> {
    match value {
        Yaml::Integer(n) => Some(*n as f64),
        other => other.as_f64(),
    }
}

/// Selects the concrete backend from the configuration.
///
/// `provider: none`, or a missing API key, yields a backend whose every call
/// fails with `NotConfigured`.
pub fn build_backend(config: &ProjectConfig, prompts: Arc<dyn PromptRegistry>) -> Arc<dyn GenerativeBackend> {
    match config.provider {
        ProviderKind::None => Arc::new(NotConfiguredBackend::new(
            "no provider configured; set `provider: openai` in dyntest.yml",
        )),
        ProviderKind::OpenAi => {
            let api_key = std::env::var(&config.api_key_env)
                .ok()
                .filter(|key| !key.trim().is_empty());
            if api_key.is_none() {
                info!(env = %config.api_key_env, "API key variable is not set");
            }
            let settings = OpenAiSettings {
                model: config.model.clone(),
                base_url: config.base_url.clone(),
                api_key,
                api_key_env: config.api_key_env.clone(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            };
            let namespace = cache_namespace("openai", &config.model, prompts.as_ref());
            let backend: Arc<dyn GenerativeBackend> = Arc::new(OpenAiBackend::new(settings, prompts));
            if config.cache.enabled {
                let cache = FileCache::new(Some(config.cache.folder.clone()), namespace);
                Arc::new(CachedBackend::new(backend, Arc::new(cache)))
            } else {
                backend
            }
        }
    }
}

/// Hash of provider, model and prompt templates; a change to any of them
/// starts from an empty cache.
fn cache_namespace(provider: &str, model: &str, prompts: &dyn PromptRegistry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    for name in [GENERATE_TESTS, REFINE_TEST] {
        hasher.update(b":");
        hasher.update(prompts.get_prompt(name).unwrap_or_default().as_bytes());
    }
    hex::encode(hasher.finalize())
}
