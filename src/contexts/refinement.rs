use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::GenerativeBackend;
use crate::data::{
    compile_pattern, AITestRequest, CandidateTest, EnrichedContext, MatchType, RequestMode, TestCase,
    TestResult,
};
use crate::errors::RefinementFailure;

use super::generation_state::{GenerationState, HistoryOutcome};
use super::test_generator::validate_candidate;
use super::variable_analyzer::analyze;

/// A match type switch the caller must be told about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchTypeChange {
    pub from: MatchType,
    pub to: MatchType,
    pub reason: String,
}

/// A corrected copy of a failing test case. The original is never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refinement {
    pub test_case: TestCase,
    pub match_type_change: Option<MatchTypeChange>,
    pub notes: Vec<String>,
}

/// Asks the backend to repair failing test cases while keeping their intent
#[derive(Clone)]
pub struct RefinementService {
    backend: Arc<dyn GenerativeBackend>,
    timeout: Duration,
    state: Option<Arc<GenerationState>>,
}

impl RefinementService {
    pub fn new(backend: Arc<dyn GenerativeBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            state: None,
        }
    }

    /// Records every refinement call in the shared generation history
    pub fn with_state(mut self, state: Arc<GenerationState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build_request(test_case: &TestCase, result: &TestResult, context: &EnrichedContext) -> AITestRequest {
        let section = &context.section;
        AITestRequest {
            section_id: section.section_id.clone(),
            section_kind: section.kind,
            section_content: section.content.clone(),
            analysis: analyze(section.kind, &section.content),
            context: context.clone(),
            count: Some(1),
            mode: RequestMode::Refine {
                original: test_case.clone(),
                actual: result.actual.clone(),
                actual_styles: result.actual_styles.clone(),
                error: result.error.clone(),
            },
        }
    }

    pub async fn refine(
        &self,
        test_case: &TestCase,
        result: &TestResult,
        context: &EnrichedContext,
    ) -> Result<Refinement, RefinementFailure> {
        let outcome = self.refine_inner(test_case, result, context).await;
        match &outcome {
            Ok(refinement) => info!(
                test = %test_case.name,
                match_type_changed = refinement.match_type_change.is_some(),
                "refined test case"
            ),
            Err(failure) => {
                warn!(test = %test_case.name, error = %failure, "refinement failed");
                if let Some(state) = &self.state {
                    state.set_error(failure.to_string());
                }
            }
        }
        outcome
    }

    async fn refine_inner(
        &self,
        test_case: &TestCase,
        result: &TestResult,
        context: &EnrichedContext,
    ) -> Result<Refinement, RefinementFailure> {
        if result.passed {
            return Err(RefinementFailure::NotFailing(test_case.name.clone()));
        }

        let request = Self::build_request(test_case, result, context);
        let response = self.backend.send(&request, self.timeout).await;
        if let Some(state) = &self.state {
            let outcome = match &response {
                Ok(response) => HistoryOutcome::Response(response.clone()),
                Err(error) => HistoryOutcome::Error(error.clone()),
            };
            state.record(&request.section_id, &request, outcome);
        }

        let proposal = response?
            .tests
            .into_iter()
            .next()
            .ok_or(RefinementFailure::EmptyResponse)?;

        apply_proposal(test_case, proposal, context)
    }
}

/// Merges the backend's proposal onto the original test case.
///
/// Name and description always come from the original. A different match
/// type is only accepted when the original one cannot pass; otherwise it is
/// reverted and a note explains why.
fn apply_proposal(
    original: &TestCase,
    mut proposal: CandidateTest,
    context: &EnrichedContext,
) -> Result<Refinement, RefinementFailure> {
    let mut notes = Vec::new();

    proposal.name = Some(original.name.clone());
    proposal.description = original.description.clone();
    if proposal.variables.is_none() {
        proposal.variables = Some(Value::Object(original.variables.clone()));
    }
    if proposal.match_type.is_none() {
        proposal.match_type = Some(original.match_type.as_str().to_string());
    }
    if proposal.expected.is_none() {
        proposal.expected = Some(Value::String(original.expected.clone()));
    }
    if proposal.expected_styles.is_none() {
        proposal.expected_styles = CandidateTest::from(original).expected_styles;
    }

    let mut refined = validate_candidate(&proposal).map_err(RefinementFailure::Invalid)?;

    let mut match_type_change = None;
    if refined.match_type != original.match_type {
        match unsatisfiable(original, context) {
            Some(reason) => {
                match_type_change = Some(MatchTypeChange {
                    from: original.match_type,
                    to: refined.match_type,
                    reason,
                });
            }
            None => {
                notes.push(format!(
                    "backend proposed matchType '{}'; kept '{}' because the original can pass",
                    refined.match_type, original.match_type
                ));
                refined.match_type = original.match_type;
                if refined.match_type == MatchType::Styles && refined.expected_styles.is_none() {
                    refined.expected_styles = original.expected_styles.clone();
                }
                refined
                    .validate()
                    .map_err(|e| RefinementFailure::Invalid(e.to_string()))?;
            }
        }
    }
    if refined.match_type != MatchType::Styles && original.match_type != MatchType::Styles {
        refined.expected_styles = original.expected_styles.clone();
    }

    if refined == *original {
        return Err(RefinementFailure::NoChange);
    }
    if refined.expected != original.expected {
        notes.push(format!(
            "expected changed from {:?} to {:?}",
            original.expected, refined.expected
        ));
    }
    if refined.variables != original.variables {
        notes.push("variable bindings changed".to_string());
    }
    if refined.expected_styles != original.expected_styles {
        notes.push("expectedStyles changed".to_string());
    }

    Ok(Refinement {
        test_case: refined,
        match_type_change,
        notes,
    })
}

/// Why the original match type can never pass, if it cannot
fn unsatisfiable(original: &TestCase, context: &EnrichedContext) -> Option<String> {
    match original.match_type {
        MatchType::Regex => compile_pattern(&original.expected)
            .err()
            .map(|e| format!("the original pattern never compiles: {}", e)),
        MatchType::Styles if original.expected_styles.is_none() => {
            Some("the original styles case has no expectedStyles".to_string())
        }
        MatchType::Styles if !context.section.has_style_effects => {
            Some("the section produces no style effects to match".to_string())
        }
        _ => None,
    }
}
