//! End-to-end checks of the generation pipeline against an in-process backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use dyntest::backend::GenerativeBackend;
use dyntest::contexts::{
    enhance, section_metadata, BatchProcessor, ContentIndex, ExecutionEngine, GenerationState, RefinementService,
    TestGenerator,
};
use dyntest::data::{
    AITestRequest, AITestResponse, BatchGenerationRequest, BatchItem, BatchItemStatus, CandidateTest, DomainContext,
    MatchType, Section, SectionKind, TestCase,
};
use dyntest::document_store::{Document, DocumentStore, FileDocumentStore};
use dyntest::errors::{BackendError, BatchItemFailure, RefinementFailure};
use dyntest::snippet::Budget;

/// Answers with canned candidates or errors keyed by section id
#[derive(Default)]
struct Scripted {
    replies: HashMap<String, Result<Vec<Value>, BackendError>>,
    delay: Option<Duration>,
}

impl Scripted {
    fn reply(mut self, section_id: &str, reply: Result<Vec<Value>, BackendError>) -> Self {
        self.replies.insert(section_id.to_string(), reply);
        self
    }
}

#[async_trait]
impl GenerativeBackend for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &AITestRequest, _timeout: Duration) -> Result<AITestResponse, BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .replies
            .get(&request.section_id)
            .cloned()
            .unwrap_or_else(|| Err(BackendError::NotConfigured("no scripted reply".to_string())))?;
        let tests = reply
            .into_iter()
            .map(|value| serde_json::from_value::<CandidateTest>(value).unwrap())
            .collect();
        Ok(AITestResponse {
            tests,
            metadata: Default::default(),
        })
    }
}

fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn greeting_candidate() -> Value {
    json!({
        "name": "greets the world",
        "variables": {"name": "World"},
        "expected": "Hello, World",
        "matchType": "exact"
    })
}

fn processor(backend: Scripted) -> (Arc<BatchProcessor>, Arc<GenerationState>, Arc<ContentIndex>) {
    let state = Arc::new(GenerationState::default());
    let index = Arc::new(ContentIndex::new());
    let processor = BatchProcessor::new(
        TestGenerator::new(Arc::new(backend), Duration::from_secs(5)),
        ExecutionEngine::with_budget(Budget::default()),
        Arc::clone(&state),
        Arc::clone(&index),
    );
    (Arc::new(processor), state, index)
}

fn batch(sections: Vec<Section>, max_concurrency: usize) -> BatchGenerationRequest {
    BatchGenerationRequest {
        items: sections
            .into_iter()
            .map(|section| BatchItem::for_section(section, Some(1)))
            .collect(),
        max_concurrency,
        context: DomainContext::default(),
        verify: true,
    }
}

#[tokio::test]
async fn exact_match_passes_for_rendered_greeting() {
    let engine = ExecutionEngine::with_budget(Budget::default());
    let section = Section::new("s1", SectionKind::Markup, "Hello, {{name}}");
    let case = TestCase::new("greets", vars(json!({"name": "World"})), "Hello, World", MatchType::Exact);

    let result = engine.evaluate(&section, &case).await;
    assert!(result.passed);
    assert_eq!(result.actual.as_deref(), Some("Hello, World"));
}

#[tokio::test]
async fn regex_match_searches_the_output() {
    let engine = ExecutionEngine::with_budget(Budget::default());
    let section = Section::new("weight", SectionKind::Markup, "{{weight}}");

    let digits = |value: &str| TestCase::new("digits", vars(json!({"weight": value})), r"^\d+$", MatchType::Regex);
    assert!(engine.evaluate(&section, &digits("42")).await.passed);

    let result = engine.evaluate(&section, &digits("42kg")).await;
    assert!(!result.passed);
    assert!(result.error.is_none());

    let broken = TestCase::new("broken", vars(json!({"weight": "42"})), "[0-9", MatchType::Regex);
    let result = engine.evaluate(&section, &broken).await;
    assert!(!result.passed);
    assert!(result.error.is_some());
}

#[test]
fn identical_content_shares_one_entry() {
    let index = ContentIndex::new();
    let h1 = index.register("s1", "A");
    let h2 = index.register("s2", "A");
    assert_eq!(h1, h2);
    assert_eq!(index.len(), 1);

    let entry = index.entry(&h1).unwrap();
    assert_eq!(entry.occurrences, 2);
    assert_eq!(entry.owners.iter().map(String::as_str).collect::<Vec<_>>(), vec!["s1", "s2"]);

    index.release("s1", &h1);
    let entry = index.entry(&h1).unwrap();
    assert_eq!(entry.occurrences, 1);
    assert!(entry.owners.contains("s2"));

    index.release("s2", &h1);
    assert!(index.entry(&h1).is_none());
    assert!(index.is_empty());
}

#[tokio::test]
async fn batch_partial_failure_reports_every_item() {
    let backend = Scripted::default()
        .reply("s1", Ok(vec![greeting_candidate()]))
        .reply("s2", Err(BackendError::MalformedResponse("not json".to_string())))
        .reply("s3", Ok(vec![greeting_candidate()]));
    let (processor, state, index) = processor(backend);

    let sections = ["s1", "s2", "s3"]
        .iter()
        .map(|id| Section::new(id, SectionKind::Markup, "Hello, {{name}}"))
        .collect();
    let progress = processor
        .run(batch(sections, 2), CancellationToken::new(), None)
        .await;

    assert_eq!(progress.completed, 3);
    assert_eq!(progress.total, 3);
    let labels: Vec<&str> = progress.outcomes.iter().map(|o| o.status.label()).collect();
    assert_eq!(labels, vec!["success", "failure", "success"]);
    assert_eq!(
        progress.outcomes[1].status,
        BatchItemStatus::Failed {
            failure: BatchItemFailure::Backend(BackendError::MalformedResponse("not json".to_string())),
        }
    );
    if let BatchItemStatus::Succeeded { results, .. } = &progress.outcomes[0].status {
        assert!(results.iter().all(|r| r.passed));
    } else {
        panic!("first item should succeed");
    }

    assert_eq!(state.batch_progress(), Some(progress));
    assert_eq!(state.history().len(), 3);
    // identical content across the three sections
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn cancelled_batch_still_terminates_every_item() {
    let mut backend = Scripted::default();
    backend.delay = Some(Duration::from_secs(30));
    for id in ["a", "b", "c"] {
        backend = backend.reply(id, Ok(vec![greeting_candidate()]));
    }
    let (processor, _, _) = processor(backend);

    let sections = ["a", "b", "c"]
        .iter()
        .map(|id| Section::new(id, SectionKind::Markup, "Hello, {{name}}"))
        .collect();
    let mut run = processor.start(batch(sections, 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    run.cancel.cancel();

    let progress = tokio::time::timeout(Duration::from_secs(5), run.handle)
        .await
        .expect("batch should stop promptly after cancellation")
        .unwrap();
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.outcomes.len(), 3);
    assert_eq!(progress.cancelled(), 3);

    let mut snapshots = 0;
    while run.progress.recv().await.is_some() {
        snapshots += 1;
    }
    assert_eq!(snapshots, 3);
}

#[tokio::test]
async fn failed_refinement_leaves_the_stored_document_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let store = FileDocumentStore::new(&path);

    let mut section = Section::new("s1", SectionKind::Markup, "Hello, {{name}}");
    section.tests.push(TestCase::new(
        "greets",
        vars(json!({"name": "World"})),
        "Hello World",
        MatchType::Exact,
    ));
    let document = Document {
        id: "doc".to_string(),
        sections: vec![section.clone()],
        ..Document::default()
    };
    store.save(&document).unwrap();
    let before = std::fs::read_to_string(&path).unwrap();

    let engine = ExecutionEngine::with_budget(Budget::default());
    let result = engine.evaluate(&section, &section.tests[0]).await;
    assert!(!result.passed);

    let backend = Scripted::default().reply("s1", Err(BackendError::Network("connection reset".to_string())));
    let service = RefinementService::new(Arc::new(backend), Duration::from_secs(1));
    let context = enhance(&document.context, &section_metadata(&section));
    let outcome = service.refine(&section.tests[0], &result, &context).await;

    assert_eq!(
        outcome,
        Err(RefinementFailure::Backend(BackendError::Network("connection reset".to_string())))
    );
    assert_eq!(store.load().unwrap(), document);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[tokio::test]
async fn candidates_failing_verification_are_not_stored() {
    let mut document = Document {
        id: "doc".to_string(),
        sections: vec![Section::new("greeting", SectionKind::Markup, "Hello, {{name}}")],
        ..Document::default()
    };
    let backend = Scripted::default().reply(
        "greeting",
        Ok(vec![
            greeting_candidate(),
            json!({
                "name": "expects a comma-less greeting",
                "variables": {"name": "Ada"},
                "expected": "Hello Ada",
                "matchType": "exact"
            }),
        ]),
    );
    let (processor, _, _) = processor(backend);
    let progress = processor
        .run(batch(document.sections.clone(), 1), CancellationToken::new(), None)
        .await;

    let (passing, failing) = progress.outcomes[0].status.verified_tests();
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].test_case.name, "expects a comma-less greeting");
    assert_eq!(failing[0].actual.as_deref(), Some("Hello, Ada"));

    assert_eq!(document.append_tests("greeting", passing).unwrap(), 1);
    let stored: Vec<&str> = document.section("greeting").unwrap().tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(stored, vec!["greets the world"]);
}

#[tokio::test]
async fn generated_tests_round_trip_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileDocumentStore::new(dir.path().join("doc.yml"));
    let mut document = Document {
        id: "doc".to_string(),
        sections: vec![
            Section::new("greeting", SectionKind::Markup, "Hello, {{name}}"),
            Section::new("total", SectionKind::Script, "let t = price * qty;\noutput(t);"),
        ],
        ..Document::default()
    };

    let backend = Scripted::default()
        .reply("greeting", Ok(vec![greeting_candidate(), json!({"name": "missing match type"})]))
        .reply(
            "total",
            Ok(vec![json!({
                "name": "multiplies",
                "variables": {"price": 4, "qty": 3},
                "expected": "12",
                "matchType": "exact"
            })]),
        );
    let (processor, _, _) = processor(backend);
    let progress = processor
        .run(batch(document.sections.clone(), 2), CancellationToken::new(), None)
        .await;

    for outcome in &progress.outcomes {
        let (passing, failing) = outcome.status.verified_tests();
        assert!(failing.is_empty());
        document.append_tests(&outcome.item_id, passing).unwrap();
    }
    let index = document.build_index();
    document.sync_index(&index);
    store.save(&document).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.section("greeting").unwrap().tests.len(), 1);
    assert_eq!(loaded.content_hashes.len(), 2);

    let summary = ExecutionEngine::with_budget(Budget::default())
        .run_document(&loaded.sections)
        .await;
    assert_eq!(summary.counts.total, 2);
    assert_eq!(summary.counts.passed, 2);
    assert_eq!(summary.sections[0].section_id, "greeting");
    assert_eq!(summary.sections[1].section_id, "total");
}
