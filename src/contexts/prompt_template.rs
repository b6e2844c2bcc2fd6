use serde::Serialize;
use serde_json::Value;

use crate::errors::PopulateError;

/// Fills `{{input.path}}` placeholders in a prompt template from a serialized input.
///
/// Supports:
/// - Mandatory: {{input.prop_name}}
/// - Optional: {{input.prop_name?}} (removed when missing)
/// - Nested: {{input.prop1.prop2}}, with numeric parts indexing arrays
///
/// Strings are inserted verbatim; objects and arrays as pretty JSON.
pub fn populate<T: Serialize>(template: &str, input: &T) -> Result<String, PopulateError> {
    let input = serde_json::to_value(input).map_err(|e| PopulateError::InvalidTemplate(e.to_string()))?;

    let mut result = template.to_string();
    let mut offset = 0;

    while let Some(start) = result[offset..].find("{{") {
        let start = offset + start;
        let Some(end) = result[start..].find("}}").map(|e| start + e) else {
            break;
        };

        let placeholder = result[start + 2..end].trim();
        let (path, is_optional) = match placeholder.strip_suffix('?') {
            Some(path) => (path.to_string(), true),
            None => (placeholder.to_string(), false),
        };

        let replacement = match resolve_path(&input, &path)? {
            Some(value) => render(value)?,
            None if is_optional => String::new(),
            None => return Err(PopulateError::MissingMandatoryPlaceholder(path)),
        };

        result.replace_range(start..end + 2, &replacement);
        // Never rescan inserted text; it may legitimately contain braces.
        offset = start + replacement.len();
    }

    Ok(result)
}

fn render(value: &Value) -> Result<String, PopulateError> {
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string_pretty(value).map_err(|e| PopulateError::InvalidTemplate(e.to_string()))?,
    })
}

/// Resolves a dotted path rooted at `input`. A missing segment is `Ok(None)`;
/// a path not rooted at `input` is an error.
fn resolve_path<'a>(value: &'a Value, path: &str) -> Result<Option<&'a Value>, PopulateError> {
    let mut parts = path.split('.');
    if parts.next() != Some("input") {
        return Err(PopulateError::InvalidPlaceholderPath(path.to_string()));
    }

    let mut current = value;
    for part in parts {
        let next = match current {
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => current.get(part),
        };
        match next {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
