mod prompt_registry;
mod provider_registry;

pub use prompt_registry::{FilePromptRegistry, PromptRegistry, GENERATE_TESTS, REFINE_TEST};
pub use provider_registry::{
    build_backend, BatchSettings, CacheSettings, ProjectConfig, ProviderKind, ProviderRegistry,
    DEFAULT_CONFIG_PATH,
};
