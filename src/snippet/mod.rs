//! Sandboxed interpreter for dynamic section content.
//!
//! Markup sections are templates with `{{ expr }}` interpolation and
//! `{{#if}}` blocks; script sections are a small statement language. Both
//! read only the variables they are given and report output plus styles.

pub mod ast;
mod interpreter;
mod lexer;
mod parser;
mod value;

pub use interpreter::{capture_style_attributes, render_markup, run_script, Budget, Rendered};
pub use parser::{parse_expression, parse_script, parse_template};
pub use value::display;

use serde_json::{Map, Value};

use crate::data::{Evaluator, SectionKind};
use crate::errors::ExecutionError;

/// The built-in `Evaluator`, backed by this module's interpreter
#[derive(Debug, Clone, Copy, Default)]
pub struct SnippetEvaluator;

impl Evaluator for SnippetEvaluator {
    fn run(
        &self,
        kind: SectionKind,
        content: &str,
        bindings: &Map<String, Value>,
        budget: &Budget,
    ) -> Result<Rendered, ExecutionError> {
        match kind {
            SectionKind::Markup => render_markup(content, bindings, budget),
            SectionKind::Script => run_script(content, bindings, budget),
        }
    }
}
