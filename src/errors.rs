use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A test case that cannot be evaluated as written
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Test case has no name")]
    MissingName,
    #[error("Test case '{0}' uses match type 'styles' but has no expectedStyles")]
    MissingExpectedStyles(String),
    #[error("Test case '{0}' has no expected value")]
    MissingExpected(String),
    #[error("Unknown match type '{0}'")]
    UnknownMatchType(String),
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Test case '{0}' has no variable bindings object")]
    MissingVariables(String),
}

/// Failures raised while running a snippet against bound variables
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("Variable '{0}' is referenced but not bound")]
    MissingVariable(String),
    #[error("Syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Execution exceeded the step limit of {0}")]
    StepLimitExceeded(u64),
    #[error("Execution timed out after {0} ms")]
    Timeout(u64),
}

/// Errors surfaced by a generative backend
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BackendError {
    #[error("Generative backend is not configured: {0}")]
    NotConfigured(String),
    #[error("Generative backend rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Network error talking to generative backend: {0}")]
    Network(String),
    #[error("Generative backend returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    /// Rate limits and transport failures may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. } | BackendError::Network(_))
    }
}

/// Why one item of a batch did not produce tests
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BatchItemFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Generated tests failed validation: {0}")]
    Validation(String),
    #[error("Batch worker failed: {0}")]
    Worker(String),
}

/// Refinement could not produce a corrected test; the original is untouched
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RefinementFailure {
    #[error("Test case '{0}' already passes and does not need refinement")]
    NotFailing(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Backend returned no refined test case")]
    EmptyResponse,
    #[error("Refined test case is invalid: {0}")]
    Invalid(String),
    #[error("Backend proposed a test case identical to the original")]
    NoChange,
}

/// Document store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse document {path}: {message}")]
    Parse { path: String, message: String },
    #[error("Section '{0}' not found")]
    SectionNotFound(String),
    #[error("Test case '{test}' not found in section '{section}'")]
    TestNotFound { section: String, test: String },
}

/// Configuration and prompt registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {message}")]
    Read { path: String, message: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur while populating a prompt template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PopulateError {
    #[error("Required placeholder '{0}' could not be resolved")]
    MissingMandatoryPlaceholder(String),
    #[error("Invalid path '{0}' in placeholder")]
    InvalidPlaceholderPath(String),
    #[error("Prompt '{0}' not found in registry")]
    PromptNotFound(String),
    #[error("Prompt template is invalid: {0}")]
    InvalidTemplate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_backend_errors() {
        assert!(BackendError::RateLimited { retry_after: None }.is_transient());
        assert!(BackendError::Network("reset".to_string()).is_transient());
        assert!(!BackendError::NotConfigured("no key".to_string()).is_transient());
        assert!(!BackendError::MalformedResponse("{".to_string()).is_transient());
    }

    #[test]
    fn batch_failure_wraps_backend_error() {
        let failure: BatchItemFailure = BackendError::MalformedResponse("bad".to_string()).into();
        assert_eq!(
            failure.to_string(),
            "Generative backend returned a malformed response: bad"
        );
    }
}
