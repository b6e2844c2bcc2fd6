//! Turning raw model text into candidate test cases.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::data::CandidateTest;
use crate::errors::BackendError;

fn reasoning_tags() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<think>[\s\S]*?</think>|<think\s*/>|<reasoning>[\s\S]*?</reasoning>")
            .unwrap_or_else(|e| panic!("reasoning tag regex: {e}"))
    })
}

/// Removes reasoning blocks some models emit before their answer
pub fn clean_llm_response(response: &str) -> String {
    reasoning_tags().replace_all(response, "").trim().to_string()
}

pub fn strip_code_fence(value: &str) -> &str {
    let trimmed = value.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) on the opening fence line.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().trim_end_matches("```").trim()
}

/// Finds the JSON document in `text`, tolerating prose around it
fn extract_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let start = text.find(['[', '{'])?;
    let end = text.rfind([']', '}'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Parses model output into candidates.
///
/// Accepts a bare array, `{"tests": [...]}`, `{"test": {...}}` or a single
/// test object. Entries that are not objects become empty candidates so the
/// caller can reject them with a reason instead of losing the whole response.
pub fn parse_candidates(raw: &str) -> Result<Vec<CandidateTest>, BackendError> {
    let cleaned = clean_llm_response(raw);
    let body = strip_code_fence(&cleaned);
    let value = extract_json(body).ok_or_else(|| {
        BackendError::MalformedResponse(format!("no JSON found in model output: {}", preview(body)))
    })?;

    let entries = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tests").or_else(|| map.remove("test")) {
            Some(Value::Array(items)) => items,
            Some(single @ Value::Object(_)) => vec![single],
            Some(other) => {
                return Err(BackendError::MalformedResponse(format!(
                    "expected a list of tests, got {}",
                    preview(&other.to_string())
                )));
            }
            None if map.contains_key("name") => vec![Value::Object(map)],
            None => {
                return Err(BackendError::MalformedResponse(
                    "JSON object has no \"tests\" field".to_string(),
                ));
            }
        },
        other => {
            return Err(BackendError::MalformedResponse(format!(
                "expected a JSON array or object, got {}",
                preview(&other.to_string())
            )));
        }
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_value(entry).unwrap_or_else(|e| {
                warn!(index, error = %e, "candidate test has an unexpected shape");
                CandidateTest::default()
            })
        })
        .collect())
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
