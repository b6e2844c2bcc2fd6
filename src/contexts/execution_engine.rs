use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::data::{
    compile_pattern, Evaluator, Matcher, Section, SectionTestResult, TestCase, TestResult,
    TestSummary,
};
use crate::errors::{ExecutionError, ValidationError};
use crate::snippet::{Budget, Rendered, SnippetEvaluator};

/// Extra time allowed on top of the interpreter's own deadline before the
/// engine gives up on the blocking evaluation thread.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// exact: both sides trimmed at the ends, then compared byte-for-byte
pub fn exact_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// contains: raw substring test; the empty string is always contained
pub fn contains_match(actual: &str, expected: &str) -> bool {
    actual.contains(expected)
}

/// regex: unanchored search; authors anchor with `^`/`$` themselves
pub fn regex_match(pattern: &str, actual: &str) -> Result<bool, ValidationError> {
    Ok(compile_pattern(pattern)?.is_match(actual))
}

/// styles: every expected property present with an equal value; extra captured
/// properties are ignored
pub fn styles_match(expected: &BTreeMap<String, String>, captured: &BTreeMap<String, String>) -> bool {
    expected.iter().all(|(prop, value)| {
        captured
            .get(&prop.trim().to_lowercase())
            .is_some_and(|actual| actual.trim() == value.trim())
    })
}

/// Runs sections against test cases and judges the results
#[derive(Clone)]
pub struct ExecutionEngine {
    evaluator: Arc<dyn Evaluator>,
    budget: Budget,
}

impl ExecutionEngine {
    pub fn new(evaluator: Arc<dyn Evaluator>, budget: Budget) -> Self {
        Self { evaluator, budget }
    }

    pub fn with_budget(budget: Budget) -> Self {
        Self::new(Arc::new(SnippetEvaluator), budget)
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Evaluates on the current thread. Never fails: every problem becomes a
    /// failed `TestResult` with `error` set.
    pub fn evaluate_blocking(&self, section: &Section, test_case: &TestCase) -> TestResult {
        let matcher = match test_case.matcher() {
            Ok(matcher) => matcher,
            Err(e) => return TestResult::failed_with(test_case, e.to_string()),
        };
        let rendered = self.evaluator.run(
            section.kind,
            &section.content,
            &test_case.variables,
            &self.budget,
        );
        judge(section, test_case, &matcher, rendered)
    }

    /// Evaluates on a blocking worker thread, bounded by the budget timeout
    pub async fn evaluate(&self, section: &Section, test_case: &TestCase) -> TestResult {
        let matcher = match test_case.matcher() {
            Ok(matcher) => matcher,
            Err(e) => return TestResult::failed_with(test_case, e.to_string()),
        };

        let evaluator = Arc::clone(&self.evaluator);
        let kind = section.kind;
        let content = section.content.clone();
        let bindings = test_case.variables.clone();
        let budget = self.budget;

        let task = tokio::task::spawn_blocking(move || evaluator.run(kind, &content, &bindings, &budget));
        let rendered = match tokio::time::timeout(budget.timeout + TIMEOUT_GRACE, task).await {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(join_err)) => Err(ExecutionError::Runtime(format!(
                "evaluator panicked: {}",
                join_err
            ))),
            Err(_) => Err(ExecutionError::Timeout(budget.timeout.as_millis() as u64)),
        };
        judge(section, test_case, &matcher, rendered)
    }

    /// Evaluates all of a section's test cases concurrently; results keep the
    /// section's test case order
    pub async fn evaluate_section(&self, section: &Section) -> SectionTestResult {
        self.evaluate_cases(section, &section.tests).await
    }

    pub async fn evaluate_cases(&self, section: &Section, cases: &[TestCase]) -> SectionTestResult {
        let results = join_all(cases.iter().map(|case| self.evaluate(section, case))).await;
        SectionTestResult {
            section_id: section.id.clone(),
            section_name: section.display_name().to_string(),
            results,
        }
    }

    /// Runs every section of a document, in document order
    pub async fn run_document(&self, sections: &[Section]) -> TestSummary {
        let mut results = Vec::with_capacity(sections.len());
        for section in sections {
            results.push(self.evaluate_section(section).await);
        }
        TestSummary::from_sections(results)
    }
}

fn judge(
    section: &Section,
    test_case: &TestCase,
    matcher: &Matcher<'_>,
    rendered: Result<Rendered, ExecutionError>,
) -> TestResult {
    let rendered = match rendered {
        Ok(rendered) => rendered,
        Err(e) => {
            debug!(section = %section.id, test = %test_case.name, error = %e, "evaluation failed");
            return TestResult::failed_with(test_case, e.to_string());
        }
    };

    let passed = match matcher {
        Matcher::Exact(expected) => exact_match(&rendered.output, expected),
        Matcher::Contains(expected) => contains_match(&rendered.output, expected),
        Matcher::Regex(pattern) => pattern.is_match(&rendered.output),
        Matcher::Styles(expected) => styles_match(expected, &rendered.styles),
    };
    if !passed {
        debug!(section = %section.id, test = %test_case.name, "test case did not match");
    }

    TestResult {
        passed,
        actual: Some(rendered.output),
        actual_styles: Some(rendered.styles),
        expected: test_case.expected.clone(),
        error: None,
        test_case: test_case.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MatchType, SectionKind};
    use serde_json::{json, Map, Value};

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn engine() -> ExecutionEngine {
        ExecutionEngine::with_budget(Budget::default())
    }

    #[test]
    fn exact_match_trims_ends_only() {
        assert!(exact_match("  Hello \n", "Hello"));
        assert!(exact_match("", ""));
        assert!(!exact_match("Hello  World", "Hello World"));
    }

    #[test]
    fn contains_match_accepts_empty_expected() {
        assert!(contains_match("anything", ""));
        assert!(contains_match("", ""));
        assert!(!contains_match("abc", "abd"));
    }

    #[test]
    fn regex_match_uses_search_semantics() {
        assert!(regex_match(r"^\d+$", "42").unwrap());
        assert!(!regex_match(r"^\d+$", "42kg").unwrap());
        assert!(regex_match(r"\d+", "about 42kg").unwrap());
        assert!(regex_match("(", "x").is_err());
    }

    #[test]
    fn styles_match_requires_every_expected_key() {
        let captured = BTreeMap::from([
            ("color".to_string(), "red".to_string()),
            ("margin".to_string(), "0".to_string()),
        ]);
        let expected = BTreeMap::from([("Color".to_string(), " red".to_string())]);
        assert!(styles_match(&expected, &captured));

        let missing = BTreeMap::from([("font-weight".to_string(), "bold".to_string())]);
        assert!(!styles_match(&missing, &captured));
    }

    #[tokio::test]
    async fn exact_match_scenario_passes() {
        let section = Section::new("s1", SectionKind::Markup, "Hello, {{name}}");
        let case = TestCase::new("greets", vars(json!({"name": "World"})), "Hello, World", MatchType::Exact);
        let result = engine().evaluate(&section, &case).await;
        assert!(result.passed, "{:?}", result);
        assert_eq!(result.actual.as_deref(), Some("Hello, World"));
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn regex_scenario_passes_and_fails() {
        let section = Section::new("s1", SectionKind::Script, "output(weight)");
        let case = TestCase::new("digits", vars(json!({"weight": "42"})), r"^\d+$", MatchType::Regex);
        assert!(engine().evaluate(&section, &case).await.passed);

        let case = TestCase::new("digits", vars(json!({"weight": "42kg"})), r"^\d+$", MatchType::Regex);
        let result = engine().evaluate(&section, &case).await;
        assert!(!result.passed);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn invalid_regex_becomes_validation_error() {
        let section = Section::new("s1", SectionKind::Script, "output('x')");
        let case = TestCase::new("broken", Map::new(), "[unclosed", MatchType::Regex);
        let result = engine().evaluate(&section, &case).await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("Invalid regex pattern"));
        assert_eq!(result.actual, None);
    }

    #[tokio::test]
    async fn missing_variable_fails_without_raising() {
        let section = Section::new("s1", SectionKind::Markup, "Hi {{name}}");
        let case = TestCase::new("no binding", Map::new(), "Hi ", MatchType::Exact);
        let result = engine().evaluate(&section, &case).await;
        assert!(!result.passed);
        assert_eq!(
            result.error.as_deref(),
            Some("Variable 'name' is referenced but not bound")
        );
    }

    #[tokio::test]
    async fn extra_bindings_are_ignored() {
        let section = Section::new("s1", SectionKind::Markup, "Hi {{name}}");
        let case = TestCase::new(
            "extra",
            vars(json!({"name": "Ada", "unused": 1})),
            "Hi Ada",
            MatchType::Exact,
        );
        assert!(engine().evaluate(&section, &case).await.passed);
    }

    #[tokio::test]
    async fn styles_scenario() {
        let section = Section::new(
            "s1",
            SectionKind::Script,
            "if urgent { style.color = 'red'; } output('notice');",
        );
        let expected = BTreeMap::from([("color".to_string(), "red".to_string())]);
        let case = TestCase::new("urgent is red", vars(json!({"urgent": true})), "", MatchType::Styles)
            .with_expected_styles(expected.clone());
        assert!(engine().evaluate(&section, &case).await.passed);

        let calm = TestCase::new("calm", vars(json!({"urgent": false})), "", MatchType::Styles)
            .with_expected_styles(expected);
        assert!(!engine().evaluate(&section, &calm).await.passed);
    }

    #[tokio::test]
    async fn runaway_snippet_times_out() {
        let engine = ExecutionEngine::with_budget(Budget {
            max_steps: u64::MAX,
            timeout: Duration::from_millis(30),
        });
        let section = Section::new("s1", SectionKind::Script, "while true { }");
        let case = TestCase::new("loop", Map::new(), "", MatchType::Contains);
        let result = engine.evaluate(&section, &case).await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn section_results_keep_case_order() {
        let mut section = Section::new("s1", SectionKind::Markup, "{{n}}");
        for n in 0..5 {
            section.tests.push(TestCase::new(
                &format!("case {}", n),
                vars(json!({"n": n})),
                &n.to_string(),
                MatchType::Exact,
            ));
        }
        let result = engine().evaluate_section(&section).await;
        let names: Vec<&str> = result.results.iter().map(|r| r.test_case.name.as_str()).collect();
        assert_eq!(names, vec!["case 0", "case 1", "case 2", "case 3", "case 4"]);
        assert!(result.results.iter().all(|r| r.passed));
    }

    #[tokio::test]
    async fn regex_is_judged_with_the_validated_pattern() {
        let section = Section::new("s1", SectionKind::Markup, "{{code}}");
        let cases: Vec<TestCase> = ["A-1", "A-22", "B-3"]
            .iter()
            .map(|code| TestCase::new(code, vars(json!({"code": code})), r"^A-\d+$", MatchType::Regex))
            .collect();
        let result = engine().evaluate_cases(&section, &cases).await;
        let verdicts: Vec<bool> = result.results.iter().map(|r| r.passed).collect();
        assert_eq!(verdicts, vec![true, true, false]);
        assert!(result.results.iter().all(|r| r.error.is_none()));
    }

    #[tokio::test]
    async fn deeply_nested_snippet_fails_without_raising() {
        let content = format!("output({}1{})", "(".repeat(5_000), ")".repeat(5_000));
        let section = Section::new("s1", SectionKind::Script, &content);
        let case = TestCase::new("deep", Map::new(), "1", MatchType::Exact);
        let result = engine().evaluate(&section, &case).await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("nesting too deep"));

        let markup = format!("{}x{}", "{{#if a}}".repeat(5_000), "{{/if}}".repeat(5_000));
        let section = Section::new("s2", SectionKind::Markup, &markup);
        let result = engine().evaluate_blocking(&section, &case);
        assert!(result.error.unwrap().contains("nesting too deep"));
    }

    #[test]
    fn blocking_evaluation_matches_async_contract() {
        let section = Section::new("s1", SectionKind::Markup, "Total: {{price * qty}}");
        let case = TestCase::new("total", vars(json!({"price": 3, "qty": 4})), "Total: 12", MatchType::Exact);
        assert!(engine().evaluate_blocking(&section, &case).passed);
    }
}
