use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

mod progress;

use progress::{print_held_back, print_refinement, print_test_summary, ProgressIndicator};
use dyntest::backend::GenerativeBackend;
use dyntest::contexts::{
    analyze as analyze_section, enhance, section_metadata, BatchProcessor, ExecutionEngine, FileCache,
    GenerationState, RefinementService, TestGenerator,
};
use dyntest::data::{BatchGenerationRequest, BatchItem, Section, SectionKind, TestResult};
use dyntest::document_store::{Document, DocumentStore, FileDocumentStore};
use dyntest::registries::{build_backend, FilePromptRegistry, PromptRegistry, ProjectConfig, ProviderRegistry};

#[derive(Clone)]
pub struct Config {
    pub verbose: bool,
    pub dry_run: bool,
    pub config_path: Option<PathBuf>,
}

fn load_project(config: &Config) -> Result<ProjectConfig> {
    ProviderRegistry::new(config.config_path.clone())
        .load()
        .context("Failed to load project configuration")
}

fn load_document(path: &Path) -> Result<(FileDocumentStore, Document)> {
    let store = FileDocumentStore::new(path);
    let document = store
        .load()
        .with_context(|| format!("Failed to load document {}", path.display()))?;
    Ok((store, document))
}

fn create_backend(project: &ProjectConfig) -> Arc<dyn GenerativeBackend> {
    let prompts: Arc<dyn PromptRegistry> = Arc::new(FilePromptRegistry::new(None));
    build_backend(project, prompts)
}

/// Script files are recognized by extension; everything else is markup
fn kind_from_path(path: &Path) -> SectionKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("script") => SectionKind::Script,
        _ => SectionKind::Markup,
    }
}

pub fn analyze(file: &Path, kind: Option<SectionKind>, config: &Config) -> Result<()> {
    let content =
        fs::read_to_string(file).with_context(|| format!("Failed to read section file {}", file.display()))?;
    let kind = kind.unwrap_or_else(|| kind_from_path(file));
    if config.verbose {
        println!("Analyzing {} as {}", file.display(), kind);
    }

    let analysis = analyze_section(kind, &content);
    for diagnostic in &analysis.diagnostics {
        warn!(file = %file.display(), "{}", diagnostic);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&analysis).context("Failed to serialize analysis")?
    );
    Ok(())
}

pub async fn run(document: &Path, config: &Config) -> Result<()> {
    let project = load_project(config)?;
    let (_, doc) = load_document(document)?;

    let engine = ExecutionEngine::with_budget(project.evaluation);
    let summary = engine.run_document(&doc.sections).await;
    print_test_summary(&summary, config.verbose);

    if summary.counts.failed > 0 {
        bail!(
            "{} of {} test case(s) failed",
            summary.counts.failed,
            summary.counts.total
        );
    }
    Ok(())
}

pub async fn generate(
    document: &Path,
    section_ids: Vec<String>,
    count: Option<usize>,
    write: bool,
    config: &Config,
) -> Result<()> {
    let project = load_project(config)?;
    let (store, mut doc) = load_document(document)?;

    let sections: Vec<Section> = if section_ids.is_empty() {
        doc.sections.clone()
    } else {
        section_ids
            .iter()
            .map(|id| {
                doc.section(id)
                    .cloned()
                    .with_context(|| format!("Section '{}' not found in {}", id, document.display()))
            })
            .collect::<Result<_>>()?
    };

    if sections.is_empty() {
        println!("No sections to generate tests for");
        return Ok(());
    }

    if config.dry_run {
        for section in &sections {
            let analysis = analyze_section(section.kind, &section.content);
            let context = enhance(&doc.context, &section_metadata(section));
            let request = TestGenerator::build_request(section, &analysis, &context, count);
            println!(
                "{}",
                serde_json::to_string_pretty(&request).context("Failed to serialize request")?
            );
        }
        return Ok(());
    }

    let index = Arc::new(doc.build_index());
    let state = Arc::new(GenerationState::with_config(project.clone()));
    let generator = TestGenerator::new(create_backend(&project), project.timeout);
    let engine = ExecutionEngine::with_budget(project.evaluation);
    let processor = Arc::new(
        BatchProcessor::new(generator, engine, Arc::clone(&state), Arc::clone(&index))
            .with_retry(project.retry_policy()),
    );

    let request = BatchGenerationRequest {
        items: sections
            .into_iter()
            .map(|section| BatchItem::for_section(section, count))
            .collect(),
        max_concurrency: project.batch.max_concurrency,
        context: doc.context.clone(),
        verify: true,
    };
    println!("Generating tests for {} section(s)", request.items.len());

    let progress = ProgressIndicator::new(request.items.len());
    let mut batch = processor.start(request);

    let cancel = batch.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling batch");
            cancel.cancel();
        }
    });

    while let Some(snapshot) = batch.progress.recv().await {
        progress.update(&snapshot);
    }
    interrupt.abort();

    let outcome = batch.handle.await.context("Batch generation task failed")?;
    progress.finish(&outcome);

    if write {
        let mut appended = 0;
        let mut held_back = 0;
        for item in &outcome.outcomes {
            let (passing, failing) = item.status.verified_tests();
            appended += doc.append_tests(&item.item_id, passing)?;
            for result in &failing {
                print_held_back(&item.item_id, result);
            }
            held_back += failing.len();
        }
        doc.sync_index(&index);
        store
            .save(&doc)
            .with_context(|| format!("Failed to save document {}", document.display()))?;
        println!("Appended {} test case(s) to {}", appended, document.display());
        if held_back > 0 {
            warn!(count = held_back, "generated test cases failed verification and were not appended");
        }
    }

    if let Some(error) = state.last_error() {
        info!(error = %error, "last backend error");
    }
    Ok(())
}

pub async fn refine(
    document: &Path,
    section_id: &str,
    test_names: Vec<String>,
    write: bool,
    config: &Config,
) -> Result<()> {
    let project = load_project(config)?;
    let (store, mut doc) = load_document(document)?;
    let section = doc
        .section(section_id)
        .cloned()
        .with_context(|| format!("Section '{}' not found in {}", section_id, document.display()))?;

    let engine = ExecutionEngine::with_budget(project.evaluation);
    let failing: Vec<TestResult> = engine
        .evaluate_section(&section)
        .await
        .results
        .into_iter()
        .filter(|r| !r.passed)
        .filter(|r| test_names.is_empty() || test_names.contains(&r.test_case.name))
        .collect();

    if failing.is_empty() {
        println!("No failing test cases to refine in section '{}'", section_id);
        return Ok(());
    }

    let context = enhance(&doc.context, &section_metadata(&section));
    if config.dry_run {
        for result in &failing {
            let request = RefinementService::build_request(&result.test_case, result, &context);
            println!(
                "{}",
                serde_json::to_string_pretty(&request).context("Failed to serialize request")?
            );
        }
        return Ok(());
    }

    let state = Arc::new(GenerationState::with_config(project.clone()));
    let service = RefinementService::new(create_backend(&project), project.timeout).with_state(state);

    println!("Refining {} failing test case(s) in '{}'", failing.len(), section_id);
    let mut replaced = 0;
    for result in &failing {
        let name = &result.test_case.name;
        match service.refine(&result.test_case, result, &context).await {
            Ok(refinement) => {
                print_refinement(name, &refinement);
                let check = engine.evaluate(&section, &refinement.test_case).await;
                println!(
                    "    re-run: {}",
                    if check.passed { "passed" } else { "still failing" }
                );
                if write {
                    doc.replace_test(section_id, name, refinement.test_case)?;
                    replaced += 1;
                }
            }
            Err(failure) => println!("✗ {}: {}", name, failure),
        }
    }

    if write && replaced > 0 {
        store
            .save(&doc)
            .with_context(|| format!("Failed to save document {}", document.display()))?;
        println!("Replaced {} test case(s) in {}", replaced, document.display());
    }
    Ok(())
}

pub fn clear_cache(config: &Config) -> Result<()> {
    let project = load_project(config)?;
    let folder = &project.cache.folder;

    if config.dry_run {
        println!("Would remove cached responses under {}", folder.display());
        return Ok(());
    }

    let removed = FileCache::clear(folder)
        .with_context(|| format!("Failed to clear cache folder {}", folder.display()))?;
    println!("Removed {} cached response(s) from {}", removed, folder.display());
    Ok(())
}
