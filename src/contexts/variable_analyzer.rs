//! Static inspection of section content.
//!
//! Walks the parsed syntax tree (never executes it) to find the free
//! variables a section reads and guesses a category for each from the
//! positions it appears in.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::data::{AnalysisResult, SectionKind, VariableCategory, VariableInfo};
use crate::snippet::ast::{BinaryOp, Expr, Segment, Stmt, UnaryOp};
use crate::snippet::{parse_script, parse_template};

const MAX_USAGES: usize = 3;

const RESERVED: &[&str] = &[
    "let", "const", "var", "if", "else", "while", "return", "true", "false", "null",
    "undefined", "style", "output", "print",
];

/// Position an expression appears in, as far as category inference cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Plain,
    Numeric,
    Text,
    /// Rendered into output; a weak hint towards string
    Rendered,
    Condition,
    Object,
    List,
}

#[derive(Debug, Default)]
struct Votes {
    numeric: u32,
    string: u32,
    boolean: u32,
    object: u32,
    list: u32,
    rendered: u32,
}

impl Votes {
    fn add(&mut self, usage: Usage) {
        match usage {
            Usage::Plain => {}
            Usage::Numeric => self.numeric += 1,
            Usage::Text => self.string += 1,
            Usage::Rendered => self.rendered += 1,
            Usage::Condition => self.boolean += 1,
            Usage::Object => self.object += 1,
            Usage::List => self.list += 1,
        }
    }

    /// One strong signal wins; conflicting strong signals are ambiguous
    fn category(&self) -> VariableCategory {
        let strong = [
            (self.numeric, VariableCategory::Numeric),
            (self.string, VariableCategory::String),
            (self.boolean, VariableCategory::Boolean),
            (self.object, VariableCategory::Object),
            (self.list, VariableCategory::List),
        ];
        let mut present = strong.iter().filter(|(count, _)| *count > 0);
        match (present.next(), present.next()) {
            (Some((_, category)), None) => *category,
            (Some(_), Some(_)) => VariableCategory::Unknown,
            (None, _) if self.rendered > 0 => VariableCategory::String,
            (None, _) => VariableCategory::Unknown,
        }
    }
}

struct Walker<'a> {
    source: &'a str,
    declared: HashSet<String>,
    order: Vec<String>,
    votes: HashMap<String, Votes>,
    usages: HashMap<String, Vec<String>>,
    boundaries: HashMap<String, Vec<Value>>,
}

impl<'a> Walker<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            declared: HashSet::new(),
            order: Vec::new(),
            votes: HashMap::new(),
            usages: HashMap::new(),
            boundaries: HashMap::new(),
        }
    }

    fn statements(&mut self, statements: &[Stmt]) {
        for statement in statements {
            self.statement(statement);
        }
    }

    fn statement(&mut self, statement: &Stmt) {
        match statement {
            Stmt::Let { name, value } | Stmt::Assign { name, value } => {
                self.expr(value, Usage::Plain);
                self.declared.insert(name.clone());
            }
            Stmt::SetStyle { value, .. } | Stmt::Output { value, .. } => {
                self.expr(value, Usage::Rendered)
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expr(value, Usage::Rendered);
                }
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr(condition, Usage::Condition);
                self.statements(then_branch);
                self.statements(else_branch);
            }
            Stmt::While { condition, body } => {
                self.expr(condition, Usage::Condition);
                self.statements(body);
            }
            Stmt::Expr(expr) => self.expr(expr, Usage::Plain),
        }
    }

    fn segments(&mut self, segments: &[Segment]) {
        for segment in segments {
            match segment {
                Segment::Text(_) => {}
                Segment::Interpolation(expr) => self.expr(expr, Usage::Rendered),
                Segment::If {
                    condition,
                    then_branch,
                    else_branch,
                } => {
                    self.expr(condition, Usage::Condition);
                    self.segments(then_branch);
                    self.segments(else_branch);
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr, usage: Usage) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Var { name, offset } => self.variable(name, *offset, usage),
            Expr::Member { object, .. } => self.expr(object, Usage::Object),
            Expr::Index { object, index } => {
                let container = match index.as_ref() {
                    Expr::Literal(Value::String(_)) => Usage::Object,
                    _ => Usage::List,
                };
                self.expr(object, container);
                self.expr(index, Usage::Plain);
            }
            Expr::Unary { op, operand } => {
                let usage = match op {
                    UnaryOp::Neg => Usage::Numeric,
                    UnaryOp::Not => Usage::Condition,
                };
                self.expr(operand, usage);
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                self.expr(condition, Usage::Condition);
                self.expr(then_value, usage);
                self.expr(else_value, usage);
            }
            Expr::Call { function, args, .. } => {
                let usage = match function.as_str() {
                    "upper" | "lower" | "trim" | "contains" => Usage::Text,
                    "abs" | "round" | "fixed" | "min" | "max" => Usage::Numeric,
                    _ => Usage::Plain,
                };
                for (i, arg) in args.iter().enumerate() {
                    // Only the receiver of `contains` is text; the needle is anything.
                    let usage = if function == "contains" && i > 0 { Usage::Plain } else { usage };
                    self.expr(arg, usage);
                }
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) {
        if op.is_arithmetic() {
            self.expr(left, Usage::Numeric);
            self.expr(right, Usage::Numeric);
            return;
        }
        if op.is_logical() {
            self.expr(left, Usage::Condition);
            self.expr(right, Usage::Condition);
            return;
        }
        if op.is_ordering() {
            self.boundary(left, right);
            self.boundary(right, left);
            self.expr(left, Usage::Numeric);
            self.expr(right, Usage::Numeric);
            return;
        }
        match op {
            BinaryOp::Add => {
                let usage = match (literal(left), literal(right)) {
                    (Some(Value::String(_)), _) | (_, Some(Value::String(_))) => Usage::Text,
                    (Some(Value::Number(_)), _) | (_, Some(Value::Number(_))) => Usage::Numeric,
                    _ => Usage::Plain,
                };
                self.expr(left, usage);
                self.expr(right, usage);
            }
            BinaryOp::Eq | BinaryOp::NotEq => {
                self.boundary(left, right);
                self.boundary(right, left);
                self.expr(left, usage_for_literal(literal(right)));
                self.expr(right, usage_for_literal(literal(left)));
            }
            _ => {
                self.expr(left, Usage::Plain);
                self.expr(right, Usage::Plain);
            }
        }
    }

    /// Records `other` as an interesting input for `side` when `side` is a free
    /// variable and `other` is a literal
    fn boundary(&mut self, side: &Expr, other: &Expr) {
        let (Expr::Var { name, .. }, Some(value)) = (side, literal(other)) else {
            return;
        };
        if self.declared.contains(name) {
            return;
        }
        let values = self.boundaries.entry(name.clone()).or_default();
        let value = tidy_number(&value);
        if !values.contains(&value) {
            values.push(value);
        }
    }

    fn variable(&mut self, name: &str, offset: usize, usage: Usage) {
        if self.declared.contains(name) || RESERVED.contains(&name) {
            return;
        }
        if !self.votes.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.votes.entry(name.to_string()).or_default().add(usage);

        let line = line_at(self.source, offset);
        let usages = self.usages.entry(name.to_string()).or_default();
        if !line.is_empty() && usages.len() < MAX_USAGES && !usages.iter().any(|u| u == line) {
            usages.push(line.to_string());
        }
    }

    fn finish(mut self) -> AnalysisResult {
        let variables = self
            .order
            .iter()
            .map(|name| VariableInfo {
                name: name.clone(),
                category: self.votes.get(name).map(Votes::category).unwrap_or(VariableCategory::Unknown),
                usages: self.usages.remove(name).unwrap_or_default(),
                boundary_values: self.boundaries.remove(name).unwrap_or_default(),
            })
            .collect();
        AnalysisResult {
            variables,
            diagnostics: Vec::new(),
        }
    }
}

/// The constant an expression denotes, folding a leading minus into numbers
fn literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match operand.as_ref() {
            Expr::Literal(Value::Number(n)) => n
                .as_f64()
                .and_then(|f| serde_json::Number::from_f64(-f))
                .map(Value::Number),
            _ => None,
        },
        _ => None,
    }
}

fn usage_for_literal(value: Option<Value>) -> Usage {
    match value {
        Some(Value::Bool(_)) => Usage::Condition,
        Some(Value::Number(_)) => Usage::Numeric,
        Some(Value::String(_)) => Usage::Text,
        _ => Usage::Plain,
    }
}

/// Parsed numbers are floats; whole ones read better as integers in prompts
fn tidy_number(value: &Value) -> Value {
    match value.as_f64() {
        Some(f) if value.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => Value::from(f as i64),
        _ => value.clone(),
    }
}

fn line_at(source: &str, offset: usize) -> &str {
    let offset = offset.min(source.len());
    let start = source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = source[offset..].find('\n').map(|i| offset + i).unwrap_or(source.len());
    source[start..end].trim()
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-z_$][A-Za-z0-9_$]*").unwrap_or_else(|e| panic!("identifier regex: {e}"))
    })
}

fn string_literal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#)
            .unwrap_or_else(|e| panic!("string literal regex: {e}"))
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{(.*?)\}\}").unwrap_or_else(|e| panic!("tag regex: {e}"))
    })
}

/// Fallback for content that does not parse: every identifier-looking word
/// that is not a keyword or a call, all of unknown category
fn scan_identifiers(kind: SectionKind, content: &str) -> Vec<VariableInfo> {
    let regions: Vec<String> = match kind {
        SectionKind::Markup => tag_pattern()
            .captures_iter(content)
            .filter_map(|c| c.get(1).map(|m| m.as_str().trim_start_matches(['#', '/']).to_string()))
            .collect(),
        SectionKind::Script => vec![content.to_string()],
    };

    let mut seen = HashSet::new();
    let mut variables = Vec::new();
    for region in regions {
        let stripped = string_literal_pattern().replace_all(&region, "\"\"");
        for m in identifier_pattern().find_iter(&stripped) {
            let name = m.as_str();
            let rest = stripped[m.end()..].trim_start();
            let before = stripped[..m.start()].trim_end();
            if RESERVED.contains(&name)
                || name == "else"
                || rest.starts_with('(')
                || before.ends_with('.')
                || before.ends_with(|c: char| c.is_ascii_digit())
            {
                continue;
            }
            if seen.insert(name.to_string()) {
                variables.push(VariableInfo {
                    name: name.to_string(),
                    category: VariableCategory::Unknown,
                    usages: Vec::new(),
                    boundary_values: Vec::new(),
                });
            }
        }
    }
    variables
}

/// Discovers the free variables of `content` with a best-effort category for each.
///
/// Never fails: content that does not parse falls back to an identifier scan
/// and the parse error is reported in `diagnostics`.
pub fn analyze(kind: SectionKind, content: &str) -> AnalysisResult {
    let mut walker = Walker::new(content);
    let parsed = match kind {
        SectionKind::Script => parse_script(content).map(|program| walker.statements(&program)),
        SectionKind::Markup => parse_template(content).map(|segments| walker.segments(&segments)),
    };
    match parsed {
        Ok(()) => walker.finish(),
        Err(e) => AnalysisResult {
            variables: scan_identifiers(kind, content),
            diagnostics: vec![format!(
                "content could not be parsed ({}); variables were found by identifier scan",
                e
            )],
        },
    }
}

/// Whether evaluating the content can produce captured styles
pub fn has_style_effects(kind: SectionKind, content: &str) -> bool {
    static ATTRIBUTE: OnceLock<Regex> = OnceLock::new();
    let attribute = ATTRIBUTE.get_or_init(|| {
        Regex::new(r"(?i)\bstyle\s*=\s*['\x22]").unwrap_or_else(|e| panic!("style regex: {e}"))
    });
    if attribute.is_match(content) {
        return true;
    }
    match kind {
        SectionKind::Markup => false,
        SectionKind::Script => parse_script(content)
            .map(|program| sets_style(&program))
            .unwrap_or_else(|_| content.contains("style.") || content.contains("style[")),
    }
}

fn sets_style(statements: &[Stmt]) -> bool {
    statements.iter().any(|statement| match statement {
        Stmt::SetStyle { .. } => true,
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => sets_style(then_branch) || sets_style(else_branch),
        Stmt::While { body, .. } => sets_style(body),
        _ => false,
    })
}
