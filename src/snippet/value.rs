use serde_json::Value;

use crate::errors::ExecutionError;

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used for output, interpolation and string concatenation
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn format_number(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

pub fn number(f: f64) -> Result<Value, ExecutionError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExecutionError::Runtime(format!("numeric result {} is not finite", f)))
}

pub fn to_number(value: &Value) -> Result<f64, ExecutionError> {
    match value {
        Value::Null => Ok(0.0),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExecutionError::Runtime(format!("cannot use {} as a number", n))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ExecutionError::Runtime(format!("cannot convert '{}' to a number", s))),
        other => Err(ExecutionError::Runtime(format!(
            "cannot convert {} to a number",
            type_name(other)
        ))),
    }
}

pub fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => to_number(left).ok() == to_number(right).ok(),
        (Value::Number(_), Value::String(s)) | (Value::String(s), Value::Number(_)) => {
            let n = if let Value::Number(_) = left { left } else { right };
            match (s.trim().parse::<f64>(), to_number(n)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        _ => left == right,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_numbers_render_without_fraction() {
        assert_eq!(display(&json!(42.0)), "42");
        assert_eq!(display(&json!(2.5)), "2.5");
        assert_eq!(display(&json!(-3)), "-3");
    }

    #[test]
    fn null_renders_empty() {
        assert_eq!(display(&Value::Null), "");
    }

    #[test]
    fn numeric_strings_compare_equal_to_numbers() {
        assert!(loose_equals(&json!("42"), &json!(42)));
        assert!(!loose_equals(&json!("42kg"), &json!(42)));
        assert!(loose_equals(&json!("a"), &json!("a")));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("no")));
    }
}
