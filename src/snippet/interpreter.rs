use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, Segment, Stmt, UnaryOp};
use super::parser::{parse_script, parse_template};
use super::value::{display, loose_equals, number, to_number, truthy, type_name};
use crate::errors::ExecutionError;

/// Upper bound on captured output, so a looping snippet cannot exhaust memory
const MAX_OUTPUT_BYTES: usize = 1 << 20;

/// Resource limits for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_steps: u64,
    pub timeout: Duration,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// What a snippet produced: its textual output and the styles it set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub output: String,
    pub styles: BTreeMap<String, String>,
}

/// Runs a script section with the given bindings
pub fn run_script(
    source: &str,
    bindings: &Map<String, Value>,
    budget: &Budget,
) -> Result<Rendered, ExecutionError> {
    let program = parse_script(source)?;
    let mut machine = Machine::new(bindings, budget);
    machine.exec_block(&program)?;

    let mut styles = capture_style_attributes(&machine.output);
    styles.extend(machine.styles);
    Ok(Rendered {
        output: machine.output,
        styles,
    })
}

/// Renders a markup section with the given bindings
pub fn render_markup(
    source: &str,
    bindings: &Map<String, Value>,
    budget: &Budget,
) -> Result<Rendered, ExecutionError> {
    let segments = parse_template(source)?;
    let mut machine = Machine::new(bindings, budget);
    machine.render(&segments)?;

    let styles = capture_style_attributes(&machine.output);
    Ok(Rendered {
        output: machine.output,
        styles,
    })
}

fn style_attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)\bstyle\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .unwrap_or_else(|e| panic!("style attribute regex: {e}"))
    })
}

/// Collects `prop: value` declarations from every inline `style` attribute.
/// Later declarations overwrite earlier ones.
pub fn capture_style_attributes(text: &str) -> BTreeMap<String, String> {
    let mut styles = BTreeMap::new();
    for caps in style_attribute_pattern().captures_iter(text) {
        let body = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        for declaration in body.split(';') {
            if let Some((prop, value)) = declaration.split_once(':') {
                let prop = prop.trim().to_lowercase();
                if !prop.is_empty() {
                    styles.insert(prop, value.trim().to_string());
                }
            }
        }
    }
    styles
}

enum Flow {
    Normal,
    Return,
}

struct Machine<'a> {
    bindings: &'a Map<String, Value>,
    locals: HashMap<String, Value>,
    output: String,
    styles: BTreeMap<String, String>,
    steps: u64,
    budget: &'a Budget,
    started: Instant,
}

impl<'a> Machine<'a> {
    fn new(bindings: &'a Map<String, Value>, budget: &'a Budget) -> Self {
        Self {
            bindings,
            locals: HashMap::new(),
            output: String::new(),
            styles: BTreeMap::new(),
            steps: 0,
            budget,
            started: Instant::now(),
        }
    }

    fn tick(&mut self) -> Result<(), ExecutionError> {
        self.steps += 1;
        if self.steps > self.budget.max_steps {
            return Err(ExecutionError::StepLimitExceeded(self.budget.max_steps));
        }
        if self.steps % 64 == 0 && self.started.elapsed() >= self.budget.timeout {
            return Err(ExecutionError::Timeout(self.budget.timeout.as_millis() as u64));
        }
        Ok(())
    }

    fn emit(&mut self, text: &str) -> Result<(), ExecutionError> {
        if self.output.len() + text.len() > MAX_OUTPUT_BYTES {
            return Err(ExecutionError::Runtime(format!(
                "output exceeded {} bytes",
                MAX_OUTPUT_BYTES
            )));
        }
        self.output.push_str(text);
        Ok(())
    }

    fn render(&mut self, segments: &[Segment]) -> Result<(), ExecutionError> {
        for segment in segments {
            self.tick()?;
            match segment {
                Segment::Text(text) => self.emit(text)?,
                Segment::Interpolation(expr) => {
                    let value = self.eval(expr)?;
                    self.emit(&display(&value))?;
                }
                Segment::If {
                    condition,
                    then_branch,
                    else_branch,
                } => {
                    let branch = if truthy(&self.eval(condition)?) {
                        then_branch
                    } else {
                        else_branch
                    };
                    self.render(branch)?;
                }
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, statements: &[Stmt]) -> Result<Flow, ExecutionError> {
        for statement in statements {
            if let Flow::Return = self.exec(statement)? {
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, statement: &Stmt) -> Result<Flow, ExecutionError> {
        self.tick()?;
        match statement {
            Stmt::Let { name, value } | Stmt::Assign { name, value } => {
                let value = self.eval(value)?;
                self.locals.insert(name.clone(), value);
            }
            Stmt::SetStyle { property, value } => {
                let value = self.eval(value)?;
                self.styles.insert(property.clone(), display(&value).trim().to_string());
            }
            Stmt::Output { value, newline } => {
                let value = self.eval(value)?;
                self.emit(&display(&value))?;
                if *newline {
                    self.emit("\n")?;
                }
            }
            Stmt::Return(value) => {
                if let Some(expr) = value {
                    let value = self.eval(expr)?;
                    self.emit(&display(&value))?;
                }
                return Ok(Flow::Return);
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let branch = if truthy(&self.eval(condition)?) {
                    then_branch
                } else {
                    else_branch
                };
                return self.exec_block(branch);
            }
            Stmt::While { condition, body } => {
                while truthy(&self.eval(condition)?) {
                    if let Flow::Return = self.exec_block(body)? {
                        return Ok(Flow::Return);
                    }
                    self.tick()?;
                }
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn lookup(&self, name: &str) -> Result<Value, ExecutionError> {
        self.locals
            .get(name)
            .or_else(|| self.bindings.get(name))
            .cloned()
            .ok_or_else(|| ExecutionError::MissingVariable(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecutionError> {
        self.tick()?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var { name, .. } => self.lookup(name),
            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                member(&object, property)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => number(-to_number(&value)?),
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    BinaryOp::And if !truthy(&left) => return Ok(left),
                    BinaryOp::Or if truthy(&left) => return Ok(left),
                    BinaryOp::And | BinaryOp::Or => return self.eval(right),
                    _ => {}
                }
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
            Expr::Call { function, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                call_builtin(function, &values)
            }
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExecutionError> {
    match op {
        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                Ok(Value::String(format!("{}{}", display(left), display(right))))
            } else {
                number(to_number(left)? + to_number(right)?)
            }
        }
        BinaryOp::Sub => number(to_number(left)? - to_number(right)?),
        BinaryOp::Mul => number(to_number(left)? * to_number(right)?),
        BinaryOp::Div | BinaryOp::Rem => {
            let divisor = to_number(right)?;
            if divisor == 0.0 {
                return Err(ExecutionError::Runtime("division by zero".to_string()));
            }
            let dividend = to_number(left)?;
            if op == BinaryOp::Div {
                number(dividend / divisor)
            } else {
                number(dividend % divisor)
            }
        }
        BinaryOp::Eq => Ok(Value::Bool(loose_equals(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_equals(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => to_number(left)?
                    .partial_cmp(&to_number(right)?)
                    .ok_or_else(|| ExecutionError::Runtime("cannot compare NaN".to_string()))?,
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(truthy(left) && truthy(right))),
    }
}

fn length(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => display(other).chars().count(),
    }
}

fn member(object: &Value, property: &str) -> Result<Value, ExecutionError> {
    match object {
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::String(_) | Value::Array(_) if property == "length" => {
            number(length(object) as f64)
        }
        other => Err(ExecutionError::Runtime(format!(
            "cannot read property '{}' of {}",
            property,
            type_name(other)
        ))),
    }
}

fn index_value(object: &Value, index: &Value) -> Result<Value, ExecutionError> {
    match object {
        Value::Array(items) => {
            let i = to_number(index)?;
            Ok(if i >= 0.0 {
                items.get(i as usize).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            })
        }
        Value::Object(map) => Ok(map.get(&display(index)).cloned().unwrap_or(Value::Null)),
        Value::String(s) => {
            let i = to_number(index)?;
            Ok(if i >= 0.0 {
                s.chars()
                    .nth(i as usize)
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null)
            } else {
                Value::Null
            })
        }
        other => Err(ExecutionError::Runtime(format!(
            "cannot index into {}",
            type_name(other)
        ))),
    }
}

fn arg<'v>(args: &'v [Value], i: usize, function: &str) -> Result<&'v Value, ExecutionError> {
    args.get(i).ok_or_else(|| {
        ExecutionError::Runtime(format!("{}() expects at least {} argument(s)", function, i + 1))
    })
}

fn call_builtin(function: &str, args: &[Value]) -> Result<Value, ExecutionError> {
    match function {
        "upper" => Ok(Value::String(display(arg(args, 0, function)?).to_uppercase())),
        "lower" => Ok(Value::String(display(arg(args, 0, function)?).to_lowercase())),
        "trim" => Ok(Value::String(display(arg(args, 0, function)?).trim().to_string())),
        "str" => Ok(Value::String(display(arg(args, 0, function)?))),
        "num" => number(to_number(arg(args, 0, function)?)?),
        "len" => number(length(arg(args, 0, function)?) as f64),
        "abs" => number(to_number(arg(args, 0, function)?)?.abs()),
        "round" => {
            let value = to_number(arg(args, 0, function)?)?;
            let digits = match args.get(1) {
                Some(d) => to_number(d)?.clamp(0.0, 12.0) as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            number((value * factor).round() / factor)
        }
        "fixed" => {
            let value = to_number(arg(args, 0, function)?)?;
            let digits = match args.get(1) {
                Some(d) => to_number(d)?.clamp(0.0, 12.0) as usize,
                None => 0,
            };
            Ok(Value::String(format!("{:.*}", digits, value)))
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(ExecutionError::Runtime(format!(
                    "{}() expects at least 1 argument(s)",
                    function
                )));
            }
            let mut best = to_number(&args[0])?;
            for value in &args[1..] {
                let n = to_number(value)?;
                best = if function == "min" { best.min(n) } else { best.max(n) };
            }
            number(best)
        }
        "contains" => {
            let haystack = arg(args, 0, function)?;
            let needle = arg(args, 1, function)?;
            let found = match haystack {
                Value::Array(items) => items.iter().any(|item| loose_equals(item, needle)),
                other => display(other).contains(&display(needle)),
            };
            Ok(Value::Bool(found))
        }
        other => Err(ExecutionError::Runtime(format!("unknown function '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn renders_interpolation() {
        let rendered =
            render_markup("Hello, {{name}}", &bindings(json!({"name": "World"})), &Budget::default())
                .unwrap();
        assert_eq!(rendered.output, "Hello, World");
        assert!(rendered.styles.is_empty());
    }

    #[test]
    fn renders_conditional_blocks() {
        let source = "{{#if count > 1}}{{count}} items{{else}}one item{{/if}}";
        let many = render_markup(source, &bindings(json!({"count": 3})), &Budget::default()).unwrap();
        let one = render_markup(source, &bindings(json!({"count": 1})), &Budget::default()).unwrap();
        assert_eq!(many.output, "3 items");
        assert_eq!(one.output, "one item");
    }

    #[test]
    fn markup_captures_inline_styles() {
        let source = r#"<p style="color: {{tone}}; font-weight: bold">x</p><span style='COLOR: blue'></span>"#;
        let rendered =
            render_markup(source, &bindings(json!({"tone": "red"})), &Budget::default()).unwrap();
        assert_eq!(rendered.styles.get("color").map(String::as_str), Some("blue"));
        assert_eq!(rendered.styles.get("font-weight").map(String::as_str), Some("bold"));
    }

    #[test]
    fn script_outputs_and_sets_styles() {
        let source = r#"
            let total = price * qty;
            if total > 100 {
                style.color = "red";
                output("Big order: " + total);
            } else {
                output("Order: " + fixed(total, 2));
            }
        "#;
        let big = run_script(source, &bindings(json!({"price": 60, "qty": 2})), &Budget::default())
            .unwrap();
        assert_eq!(big.output, "Big order: 120");
        assert_eq!(big.styles.get("color").map(String::as_str), Some("red"));

        let small = run_script(source, &bindings(json!({"price": 2.5, "qty": 2})), &Budget::default())
            .unwrap();
        assert_eq!(small.output, "Order: 5.00");
        assert!(small.styles.is_empty());
    }

    #[test]
    fn return_halts_execution() {
        let rendered = run_script(
            "if flag { return 'early'; } output('late');",
            &bindings(json!({"flag": true})),
            &Budget::default(),
        )
        .unwrap();
        assert_eq!(rendered.output, "early");
    }

    #[test]
    fn missing_variable_is_reported() {
        let err = run_script("output(name)", &Map::new(), &Budget::default()).unwrap_err();
        assert_eq!(err, ExecutionError::MissingVariable("name".to_string()));
    }

    #[test]
    fn runaway_loop_hits_step_limit() {
        let budget = Budget {
            max_steps: 500,
            timeout: Duration::from_secs(5),
        };
        let err = run_script("while true { }", &Map::new(), &budget).unwrap_err();
        assert_eq!(err, ExecutionError::StepLimitExceeded(500));
    }

    #[test]
    fn runaway_loop_hits_timeout() {
        let budget = Budget {
            max_steps: u64::MAX,
            timeout: Duration::from_millis(20),
        };
        let err = run_script("let i = 0; while true { i = i + 1; }", &Map::new(), &budget).unwrap_err();
        assert_eq!(err, ExecutionError::Timeout(20));
    }

    #[test]
    fn member_and_index_access() {
        let rendered = run_script(
            "print(user.name); print(tags[1]); print(tags.length);",
            &bindings(json!({"user": {"name": "Ada"}, "tags": ["a", "b"]})),
            &Budget::default(),
        )
        .unwrap();
        assert_eq!(rendered.output, "Ada\nb\n2\n");
    }

    #[test]
    fn logical_operators_return_operands() {
        let rendered = run_script(
            "output(nickname || 'guest')",
            &bindings(json!({"nickname": ""})),
            &Budget::default(),
        )
        .unwrap();
        assert_eq!(rendered.output, "guest");
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let err = run_script("output(1 / d)", &bindings(json!({"d": 0})), &Budget::default())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Runtime(_)));
    }

    #[test]
    fn builtins_and_methods() {
        let rendered = run_script(
            "output(name.toUpperCase() + '-' + round(3.14159, 2) + '-' + contains(tags, 'x'))",
            &bindings(json!({"name": "ada", "tags": ["x"]})),
            &Budget::default(),
        )
        .unwrap();
        assert_eq!(rendered.output, "ADA-3.14-true");
    }
}
