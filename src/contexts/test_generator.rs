use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::backend::{send_with_retry, GenerativeBackend, RetryPolicy};
use crate::data::{
    AITestRequest, AITestResponse, AnalysisResult, CandidateTest, EnrichedContext, GeneratedTest,
    MatchType, RejectedCandidate, RequestMode, Section, TestCase, TestQualityMetrics,
    SUB_SCORE_COVERAGE, SUB_SCORE_EDGE_CASES, SUB_SCORE_SPECIFICITY,
};
use crate::errors::BackendError;

const WEIGHT_COVERAGE: f64 = 0.4;
const WEIGHT_SPECIFICITY: f64 = 0.4;
const WEIGHT_EDGE_CASES: f64 = 0.2;

/// Validated output of one backend call
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTests {
    pub response: AITestResponse,
    pub tests: Vec<GeneratedTest>,
    pub rejected: Vec<RejectedCandidate>,
}

/// A request paired with what came back for it
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStep {
    pub section_id: String,
    pub request: AITestRequest,
    pub result: Result<GeneratedTests, BackendError>,
}

/// Proposes test cases for a section through a generative backend
#[derive(Clone)]
pub struct TestGenerator {
    backend: Arc<dyn GenerativeBackend>,
    timeout: Duration,
}

impl TestGenerator {
    pub fn new(backend: Arc<dyn GenerativeBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend(&self) -> &Arc<dyn GenerativeBackend> {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the grounded request: content plus analysis plus enriched context
    pub fn build_request(
        section: &Section,
        analysis: &AnalysisResult,
        context: &EnrichedContext,
        count: Option<usize>,
    ) -> AITestRequest {
        AITestRequest {
            section_id: section.id.clone(),
            section_kind: section.kind,
            section_content: section.content.clone(),
            analysis: analysis.clone(),
            context: context.clone(),
            count,
            mode: RequestMode::Generate,
        }
    }

    /// One backend call, no retries. Backend errors are captured in the step.
    pub async fn generate(
        &self,
        section: &Section,
        analysis: &AnalysisResult,
        context: &EnrichedContext,
        count: Option<usize>,
    ) -> GenerationStep {
        self.generate_with_retry(section, analysis, context, count, &RetryPolicy::none())
            .await
    }

    /// Like `generate`, retrying transient backend errors under `policy`
    pub async fn generate_with_retry(
        &self,
        section: &Section,
        analysis: &AnalysisResult,
        context: &EnrichedContext,
        count: Option<usize>,
        policy: &RetryPolicy,
    ) -> GenerationStep {
        let request = Self::build_request(section, analysis, context, count);
        let result = send_with_retry(self.backend.as_ref(), &request, self.timeout, policy)
            .await
            .map(|response| accept_response(response, analysis));

        match &result {
            Ok(generated) => info!(
                section = %section.id,
                accepted = generated.tests.len(),
                rejected = generated.rejected.len(),
                "generated test cases"
            ),
            Err(e) => warn!(section = %section.id, error = %e, "test generation failed"),
        }

        GenerationStep {
            section_id: section.id.clone(),
            request,
            result,
        }
    }
}

/// Validates every candidate, keeping the good ones with metrics and
/// recording a reason for each dropped one
pub(crate) fn accept_response(response: AITestResponse, analysis: &AnalysisResult) -> GeneratedTests {
    let mut tests = Vec::new();
    let mut rejected = Vec::new();
    let mut names = HashSet::new();

    for (index, candidate) in response.tests.iter().enumerate() {
        let outcome = validate_candidate(candidate).and_then(|test_case| {
            if names.insert(test_case.name.clone()) {
                Ok(test_case)
            } else {
                Err(format!("duplicate test name '{}'", test_case.name))
            }
        });
        match outcome {
            Ok(test_case) => {
                let metrics = score(&test_case, analysis, candidate.quality.as_ref());
                tests.push(GeneratedTest { test_case, metrics });
            }
            Err(reason) => {
                warn!(index, reason = %reason, "dropping generated test case");
                rejected.push(RejectedCandidate {
                    index,
                    name: candidate.name.clone(),
                    reason,
                });
            }
        }
    }

    GeneratedTests {
        response,
        tests,
        rejected,
    }
}

/// Turns a backend candidate into a `TestCase`, or explains why it cannot be one
pub(crate) fn validate_candidate(candidate: &CandidateTest) -> Result<TestCase, String> {
    let name = candidate
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing name".to_string())?;

    let match_type = candidate
        .match_type
        .as_deref()
        .ok_or_else(|| "missing matchType".to_string())
        .and_then(|m| MatchType::parse(m).map_err(|e| e.to_string()))?;

    let variables = match &candidate.variables {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => return Err("missing variables".to_string()),
        Some(_) => return Err("variables must be an object".to_string()),
    };

    let expected = match (&candidate.expected, match_type) {
        (None | Some(Value::Null), MatchType::Styles) => String::new(),
        (None | Some(Value::Null), _) => return Err("missing expected value".to_string()),
        (Some(value), _) => scalar_text(value).ok_or_else(|| "expected must be a string".to_string())?,
    };

    let expected_styles = match &candidate.expected_styles {
        None => None,
        Some(styles) => {
            let mut converted = BTreeMap::new();
            for (prop, value) in styles {
                let text = scalar_text(value)
                    .ok_or_else(|| format!("expectedStyles.{} must be a string", prop))?;
                converted.insert(prop.trim().to_lowercase(), text);
            }
            Some(converted)
        }
    };

    let test_case = TestCase {
        name: name.to_string(),
        variables,
        expected,
        match_type,
        expected_styles,
        description: candidate.description.clone(),
    };
    test_case.validate().map_err(|e| e.to_string())?;
    Ok(test_case)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Backend-supplied quality wins where present; computed sub-scores fill the gaps
fn score(test_case: &TestCase, analysis: &AnalysisResult, supplied: Option<&TestQualityMetrics>) -> TestQualityMetrics {
    let computed = compute_metrics(test_case, analysis);
    match supplied {
        Some(supplied) => {
            let mut merged = supplied.clone();
            for (key, value) in computed.sub_scores {
                merged.sub_scores.entry(key).or_insert(value);
            }
            merged.clamped()
        }
        None => computed,
    }
}

pub fn compute_metrics(test_case: &TestCase, analysis: &AnalysisResult) -> TestQualityMetrics {
    let coverage = coverage(&test_case.variables, analysis);
    let specificity = specificity(test_case);
    let edge_cases = if exercises_edge_case(&test_case.variables, analysis) { 1.0 } else { 0.0 };

    TestQualityMetrics {
        score: WEIGHT_COVERAGE * coverage + WEIGHT_SPECIFICITY * specificity + WEIGHT_EDGE_CASES * edge_cases,
        sub_scores: BTreeMap::from([
            (SUB_SCORE_COVERAGE.to_string(), coverage),
            (SUB_SCORE_SPECIFICITY.to_string(), specificity),
            (SUB_SCORE_EDGE_CASES.to_string(), edge_cases),
        ]),
    }
    .clamped()
}

/// Share of the analyzed variables the case binds
fn coverage(variables: &Map<String, Value>, analysis: &AnalysisResult) -> f64 {
    if analysis.variables.is_empty() {
        return 1.0;
    }
    let bound = analysis
        .variables
        .iter()
        .filter(|v| variables.contains_key(&v.name))
        .count();
    bound as f64 / analysis.variables.len() as f64
}

/// How much a passing verdict actually pins down
fn specificity(test_case: &TestCase) -> f64 {
    let expected = test_case.expected.trim();
    match test_case.match_type {
        MatchType::Styles => {
            let count = test_case.expected_styles.as_ref().map_or(0, |s| s.len());
            (0.5 + 0.25 * count as f64).min(1.0)
        }
        _ if expected.is_empty() => 0.0,
        MatchType::Exact => 1.0,
        MatchType::Regex if expected.starts_with('^') || expected.ends_with('$') => 0.9,
        MatchType::Regex => 0.6,
        MatchType::Contains => 0.3 + 0.5 * (expected.chars().count() as f64 / 20.0).min(1.0),
    }
}

/// Whether any bound value sits on or next to a boundary the analyzer found,
/// or is a classic edge input (empty, zero, negative, false)
fn exercises_edge_case(variables: &Map<String, Value>, analysis: &AnalysisResult) -> bool {
    variables.iter().any(|(name, value)| {
        let near_boundary = analysis.variable(name).is_some_and(|info| {
            info.boundary_values.iter().any(|boundary| match (value.as_f64(), boundary.as_f64()) {
                (Some(v), Some(b)) => (v - b).abs() <= 1.0,
                _ => value == boundary,
            })
        });
        near_boundary
            || match value {
                Value::String(s) => s.is_empty(),
                Value::Number(n) => n.as_f64().is_some_and(|f| f <= 0.0),
                Value::Bool(b) => !b,
                Value::Array(items) => items.is_empty(),
                Value::Null => true,
                Value::Object(_) => false,
            }
    })
}
