//! Bounded-concurrency fan-out of test generation across many sections.
//!
//! Every submitted item produces exactly one outcome. On cancellation,
//! items still waiting for a worker slot and items in flight are both
//! abandoned and reported as `Cancelled`; a backend call that was under way
//! is dropped with its future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::RetryPolicy;
use crate::data::{
    AnalysisResult, BatchGenerationProgress, BatchGenerationRequest, BatchItem, BatchItemOutcome,
    BatchItemStatus, DomainContext, TestCase,
};
use crate::errors::BatchItemFailure;

use super::content_index::ContentIndex;
use super::context_enhancement::{enhance, section_metadata};
use super::execution_engine::ExecutionEngine;
use super::generation_state::GenerationState;
use super::test_generator::TestGenerator;
use super::variable_analyzer::analyze;

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// A batch running in the background
pub struct BatchRun {
    /// One snapshot per finished item; closes when the batch ends
    pub progress: mpsc::UnboundedReceiver<BatchGenerationProgress>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<BatchGenerationProgress>,
}

pub struct BatchProcessor {
    generator: TestGenerator,
    engine: ExecutionEngine,
    state: Arc<GenerationState>,
    index: Arc<ContentIndex>,
    retry: RetryPolicy,
}

impl BatchProcessor {
    pub fn new(
        generator: TestGenerator,
        engine: ExecutionEngine,
        state: Arc<GenerationState>,
        index: Arc<ContentIndex>,
    ) -> Self {
        Self {
            generator,
            engine,
            state,
            index,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Spawns `run` and hands back its progress feed and cancel handle
    pub fn start(self: Arc<Self>, request: BatchGenerationRequest) -> BatchRun {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(request, token, Some(tx)).await });
        BatchRun {
            progress: rx,
            cancel,
            handle,
        }
    }

    /// Runs every item and returns the terminal snapshot, in which
    /// `completed == total` and outcomes are ordered by submission index.
    pub async fn run(
        &self,
        request: BatchGenerationRequest,
        cancel: CancellationToken,
        progress_tx: Option<mpsc::UnboundedSender<BatchGenerationProgress>>,
    ) -> BatchGenerationProgress {
        let total = request.items.len();
        let max_concurrency = request.max_concurrency.max(1);
        info!(total, max_concurrency, "starting batch generation");

        let mut progress = BatchGenerationProgress::new(total);
        self.state.set_batch_progress(Some(progress.clone()));

        let worker = Worker {
            generator: self.generator.clone(),
            engine: self.engine.clone(),
            state: Arc::clone(&self.state),
            index: Arc::clone(&self.index),
            retry: self.retry,
            context: Arc::new(request.context),
            verify: request.verify,
            analyses: Arc::new(Mutex::new(HashMap::new())),
        };
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        let mut pending = FuturesUnordered::new();
        for (index, item) in request.items.into_iter().enumerate() {
            let item_id = item.item_id.clone();
            let handle = tokio::spawn(run_item(
                worker.clone(),
                item,
                Arc::clone(&semaphore),
                cancel.clone(),
            ));
            pending.push(async move { (index, item_id, handle.await) });
        }

        while let Some((index, item_id, joined)) = pending.next().await {
            let status = joined.unwrap_or_else(|e| BatchItemStatus::Failed {
                failure: BatchItemFailure::Worker(e.to_string()),
            });
            info!(item = %item_id, status = status.label(), "batch item finished");
            progress.record(BatchItemOutcome {
                item_id,
                index,
                status,
            });
            self.state.set_batch_progress(Some(progress.clone()));
            if let Some(tx) = &progress_tx {
                // A dropped receiver only means nobody is watching.
                let _ = tx.send(progress.clone());
            }
        }

        info!(
            succeeded = progress.succeeded(),
            failed = progress.failed(),
            cancelled = progress.cancelled(),
            "batch generation finished"
        );
        progress
    }
}

async fn run_item(
    worker: Worker,
    item: BatchItem,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) -> BatchItemStatus {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return BatchItemStatus::Cancelled,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return BatchItemStatus::Cancelled,
        },
    };

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(item = %item.item_id, "abandoning in-flight item");
            BatchItemStatus::Cancelled
        }
        status = worker.process(&item) => status,
    };
    drop(permit);
    status
}

#[derive(Clone)]
struct Worker {
    generator: TestGenerator,
    engine: ExecutionEngine,
    state: Arc<GenerationState>,
    index: Arc<ContentIndex>,
    retry: RetryPolicy,
    context: Arc<DomainContext>,
    verify: bool,
    /// content hash -> analysis, shared by items with identical content
    analyses: Arc<Mutex<HashMap<String, AnalysisResult>>>,
}

impl Worker {
    async fn process(&self, item: &BatchItem) -> BatchItemStatus {
        let section = &item.section;
        info!(item = %item.item_id, section = %section.id, "batch item started");

        let hash = self.index.register(&section.id, &section.content);
        let analysis = self.analysis(&hash, section.kind, &section.content);
        let context = enhance(&self.context, &section_metadata(section));

        let step = self
            .generator
            .generate_with_retry(section, &analysis, &context, item.count, &self.retry)
            .await;
        self.state.record_step(&step);

        let generated = match step.result {
            Ok(generated) => generated,
            Err(error) => {
                return BatchItemStatus::Failed {
                    failure: error.into(),
                };
            }
        };
        if generated.tests.is_empty() {
            let reasons: Vec<String> = generated
                .rejected
                .iter()
                .map(|r| format!("#{}: {}", r.index, r.reason))
                .collect();
            let detail = if reasons.is_empty() {
                "backend returned no test cases".to_string()
            } else {
                format!("no usable test cases ({})", reasons.join("; "))
            };
            return BatchItemStatus::Failed {
                failure: BatchItemFailure::Validation(detail),
            };
        }

        let results = if self.verify {
            let cases: Vec<TestCase> = generated.tests.iter().map(|t| t.test_case.clone()).collect();
            self.engine.evaluate_cases(section, &cases).await.results
        } else {
            Vec::new()
        };

        BatchItemStatus::Succeeded {
            tests: generated.tests,
            rejected: generated.rejected,
            results,
        }
    }

    fn analysis(&self, hash: &str, kind: crate::data::SectionKind, content: &str) -> AnalysisResult {
        let key = format!("{}:{}", kind, hash);
        let mut analyses = self.analyses.lock().unwrap_or_else(PoisonError::into_inner);
        analyses
            .entry(key)
            .or_insert_with(|| analyze(kind, content))
            .clone()
    }
}
