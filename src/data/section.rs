use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;

/// Whether a section is a markup template or a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Markup,
    Script,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SectionKind::Markup => write!(f, "markup"),
            SectionKind::Script => write!(f, "script"),
        }
    }
}

/// An authored unit of dynamic content with its test cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: SectionKind,
    #[serde(default)]
    pub position: u32,
    pub content: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl Section {
    pub fn new(id: &str, kind: SectionKind, content: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            position: 0,
            content: content.to_string(),
            tests: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Comparison algorithm used to judge a test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
    Styles,
}

impl MatchType {
    pub const ALL: [MatchType; 4] = [
        MatchType::Exact,
        MatchType::Contains,
        MatchType::Regex,
        MatchType::Styles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
            MatchType::Styles => "styles",
        }
    }

    /// Parses a match type name, case-insensitively
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        let wanted = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownMatchType(name.to_string()))
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named assertion over one execution of a section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub expected: String,
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_styles: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestCase {
    pub fn new(name: &str, variables: Map<String, Value>, expected: &str, match_type: MatchType) -> Self {
        Self {
            name: name.to_string(),
            variables,
            expected: expected.to_string(),
            match_type,
            expected_styles: None,
            description: None,
        }
    }

    pub fn with_expected_styles(mut self, styles: BTreeMap<String, String>) -> Self {
        self.expected_styles = Some(styles);
        self
    }

    /// Checks the structural invariants and compiles regex patterns
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.matcher().map(|_| ())
    }

    /// Validates the case and prepares its match policy for judging
    pub fn matcher(&self) -> Result<Matcher<'_>, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }
        match self.match_type {
            MatchType::Exact => Ok(Matcher::Exact(&self.expected)),
            MatchType::Contains => Ok(Matcher::Contains(&self.expected)),
            MatchType::Regex => compile_pattern(&self.expected).map(Matcher::Regex),
            MatchType::Styles => self
                .expected_styles
                .as_ref()
                .map(Matcher::Styles)
                .ok_or_else(|| ValidationError::MissingExpectedStyles(self.name.clone())),
        }
    }
}

/// A test case's expectation with any regex already compiled
#[derive(Debug, Clone)]
pub enum Matcher<'a> {
    Exact(&'a str),
    Contains(&'a str),
    Regex(Regex),
    Styles(&'a BTreeMap<String, String>),
}

pub fn compile_pattern(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Verdict for one test case. Derived from a run, never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_styles: Option<BTreeMap<String, String>>,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub test_case: TestCase,
}

impl TestResult {
    pub fn failed_with(test_case: &TestCase, error: String) -> Self {
        Self {
            passed: false,
            actual: None,
            actual_styles: None,
            expected: test_case.expected.clone(),
            error: Some(error),
            test_case: test_case.clone(),
        }
    }
}

/// Results for one section, in the section's test case order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionTestResult {
    pub section_id: String,
    pub section_name: String,
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub sections: Vec<SectionTestResult>,
    pub counts: SummaryCounts,
}

impl TestSummary {
    /// Builds a summary whose counts are derived from the section results
    pub fn from_sections(sections: Vec<SectionTestResult>) -> Self {
        let total = sections.iter().map(|s| s.results.len()).sum();
        let passed = sections
            .iter()
            .flat_map(|s| s.results.iter())
            .filter(|r| r.passed)
            .count();
        Self {
            sections,
            counts: SummaryCounts {
                total,
                passed,
                failed: total - passed,
            },
        }
    }
}
