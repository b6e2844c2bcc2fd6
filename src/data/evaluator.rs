use serde_json::{Map, Value};

use super::SectionKind;
use crate::errors::ExecutionError;
use crate::snippet::{Budget, Rendered};

/// Capability that executes section content against bound variables.
///
/// Each call must use a fresh evaluation context and honour `budget`;
/// implementations are shared across concurrent evaluations.
pub trait Evaluator: Send + Sync {
    fn run(
        &self,
        kind: SectionKind,
        content: &str,
        bindings: &Map<String, Value>,
        budget: &Budget,
    ) -> Result<Rendered, ExecutionError>;
}
