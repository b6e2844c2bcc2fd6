use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AnalysisResult, EnrichedContext, Section, SectionKind, TestCase, TestResult};
use crate::errors::BatchItemFailure;

pub const SUB_SCORE_COVERAGE: &str = "coverage";
pub const SUB_SCORE_SPECIFICITY: &str = "specificity";
pub const SUB_SCORE_EDGE_CASES: &str = "edgeCases";

/// Scored usefulness of one generated test case; every value is in `0.0..=1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestQualityMetrics {
    pub score: f64,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, f64>,
}

impl TestQualityMetrics {
    /// Clamps the score and sub-scores into range, mapping NaN to 0
    pub fn clamped(mut self) -> Self {
        self.score = clamp_unit(self.score);
        for value in self.sub_scores.values_mut() {
            *value = clamp_unit(*value);
        }
        self
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// What the backend is being asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RequestMode {
    Generate,
    #[serde(rename_all = "camelCase")]
    Refine {
        original: TestCase,
        actual: Option<String>,
        actual_styles: Option<BTreeMap<String, String>>,
        error: Option<String>,
    },
}

impl RequestMode {
    /// Prompt registry key for this mode
    pub fn prompt_name(&self) -> &'static str {
        match self {
            RequestMode::Generate => "generate_tests",
            RequestMode::Refine { .. } => "refine_test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AITestRequest {
    pub section_id: String,
    pub section_kind: SectionKind,
    pub section_content: String,
    pub analysis: AnalysisResult,
    pub context: EnrichedContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(flatten)]
    pub mode: RequestMode,
}

impl AITestRequest {
    pub fn population_category(&self) -> &str {
        &self.context.population_category
    }

    pub fn advisor_category(&self) -> &str {
        &self.context.advisor_category
    }
}

/// A test case as proposed by the backend, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default, alias = "match_type")]
    pub match_type: Option<String>,
    #[serde(default, alias = "expected_styles")]
    pub expected_styles: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quality: Option<TestQualityMetrics>,
}

impl From<&TestCase> for CandidateTest {
    fn from(test_case: &TestCase) -> Self {
        Self {
            name: Some(test_case.name.clone()),
            variables: Some(Value::Object(test_case.variables.clone())),
            expected: Some(Value::String(test_case.expected.clone())),
            match_type: Some(test_case.match_type.as_str().to_string()),
            expected_styles: test_case.expected_styles.as_ref().map(|styles| {
                styles
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect()
            }),
            description: test_case.description.clone(),
            quality: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AITestResponse {
    pub tests: Vec<CandidateTest>,
    pub metadata: ProviderMetadata,
}

/// A validated test case with its quality assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTest {
    pub test_case: TestCase,
    pub metrics: TestQualityMetrics,
}

/// A backend candidate that was dropped, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedCandidate {
    pub index: usize,
    pub name: Option<String>,
    pub reason: String,
}

/// One section queued for batch generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub item_id: String,
    pub section: Section,
    #[serde(default)]
    pub count: Option<usize>,
}

impl BatchItem {
    pub fn for_section(section: Section, count: Option<usize>) -> Self {
        Self {
            item_id: section.id.clone(),
            section,
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGenerationRequest {
    pub items: Vec<BatchItem>,
    pub max_concurrency: usize,
    #[serde(default)]
    pub context: crate::data::DomainContext,
    /// Run each generated test through the execution engine before reporting
    #[serde(default)]
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BatchItemStatus {
    Succeeded {
        tests: Vec<GeneratedTest>,
        rejected: Vec<RejectedCandidate>,
        results: Vec<TestResult>,
    },
    Failed {
        failure: BatchItemFailure,
    },
    Cancelled,
}

impl BatchItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BatchItemStatus::Succeeded { .. } => "success",
            BatchItemStatus::Failed { .. } => "failure",
            BatchItemStatus::Cancelled => "cancelled",
        }
    }

    /// Test cases safe to store, and the verification results of those that are not.
    ///
    /// A verified item keeps only the cases whose run passed. An item that was
    /// never verified keeps every accepted case.
    pub fn verified_tests(&self) -> (Vec<TestCase>, Vec<TestResult>) {
        let BatchItemStatus::Succeeded { tests, results, .. } = self else {
            return (Vec::new(), Vec::new());
        };
        if results.is_empty() {
            return (tests.iter().map(|t| t.test_case.clone()).collect(), Vec::new());
        }
        let (passed, failed): (Vec<&TestResult>, Vec<&TestResult>) = results.iter().partition(|r| r.passed);
        (
            passed.into_iter().map(|r| r.test_case.clone()).collect(),
            failed.into_iter().cloned().collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemOutcome {
    pub item_id: String,
    /// Submission position of the originating request
    pub index: usize,
    pub status: BatchItemStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGenerationProgress {
    pub completed: usize,
    pub total: usize,
    pub current_item: Option<String>,
    /// Outcomes recorded so far, ordered by submission index
    pub outcomes: Vec<BatchItemOutcome>,
}

impl BatchGenerationProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            current_item: None,
            outcomes: Vec::new(),
        }
    }

    /// Records one finished item; `completed` grows by exactly one
    pub fn record(&mut self, outcome: BatchItemOutcome) {
        let position = self
            .outcomes
            .partition_point(|existing| existing.index < outcome.index);
        self.current_item = Some(outcome.item_id.clone());
        self.outcomes.insert(position, outcome);
        self.completed += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }

    fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.label() == label)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count("success")
    }

    pub fn failed(&self) -> usize {
        self.count("failure")
    }

    pub fn cancelled(&self) -> usize {
        self.count("cancelled")
    }
}
