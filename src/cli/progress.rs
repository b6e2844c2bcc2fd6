use std::time::Instant;

use dyntest::contexts::Refinement;
use dyntest::data::{BatchGenerationProgress, BatchItemOutcome, BatchItemStatus, TestResult, TestSummary};

/// Prints one line per finished batch item and a closing summary
pub struct ProgressIndicator {
    total: usize,
    start_time: Instant,
}

impl ProgressIndicator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            start_time: Instant::now(),
        }
    }

    /// Reports the item named by `current_item` in a fresh snapshot
    pub fn update(&self, snapshot: &BatchGenerationProgress) {
        let Some(current) = snapshot.current_item.as_deref() else {
            return;
        };
        if let Some(outcome) = snapshot.outcomes.iter().find(|o| o.item_id == current) {
            println!("{} ({}/{})", describe(outcome), snapshot.completed, self.total);
        }
    }

    pub fn finish(&self, progress: &BatchGenerationProgress) {
        let elapsed = self.start_time.elapsed();
        println!("\n{}", "=".repeat(60));
        println!("Summary:");
        println!("  Total:     {}", progress.total);
        println!("  Succeeded: {}", progress.succeeded());
        println!("  Failed:    {}", progress.failed());
        println!("  Cancelled: {}", progress.cancelled());
        println!("  Duration:  {:.2}s", elapsed.as_secs_f64());
        println!("{}", "=".repeat(60));
    }
}

fn describe(outcome: &BatchItemOutcome) -> String {
    match &outcome.status {
        BatchItemStatus::Succeeded {
            tests,
            rejected,
            results,
        } => {
            let mut line = format!(
                "✓ {}: {} test(s) accepted, {} rejected",
                outcome.item_id,
                tests.len(),
                rejected.len()
            );
            let failing = results.iter().filter(|r| !r.passed).count();
            if failing > 0 {
                line.push_str(&format!(", {} failing verification", failing));
            }
            line
        }
        BatchItemStatus::Failed { failure } => format!("✗ {}: {}", outcome.item_id, failure),
        BatchItemStatus::Cancelled => format!("⊘ {}: cancelled", outcome.item_id),
    }
}

pub fn print_test_summary(summary: &TestSummary, verbose: bool) {
    for section in &summary.sections {
        println!("{}", section.section_name);
        for result in &section.results {
            if result.passed {
                println!("  ✓ {}", result.test_case.name);
                continue;
            }
            println!("  ✗ {}", result.test_case.name);
            match &result.error {
                Some(error) => println!("      error:    {}", error),
                None => {
                    println!("      expected: {:?}", result.expected);
                    println!("      actual:   {:?}", result.actual.as_deref().unwrap_or(""));
                }
            }
            if verbose {
                if let Some(styles) = &result.actual_styles {
                    println!("      styles:   {:?}", styles);
                }
            }
        }
    }
    println!(
        "\n{} passed, {} failed, {} total",
        summary.counts.passed, summary.counts.failed, summary.counts.total
    );
}

/// A generated case that failed verification; it needs refining before it can be kept
pub fn print_held_back(section_id: &str, result: &TestResult) {
    println!("✗ {}/{}: failed verification, needs refinement", section_id, result.test_case.name);
    match &result.error {
        Some(error) => println!("      error:    {}", error),
        None => {
            println!("      expected: {:?}", result.expected);
            println!("      actual:   {:?}", result.actual.as_deref().unwrap_or(""));
        }
    }
}

pub fn print_refinement(name: &str, refinement: &Refinement) {
    println!("✓ {}", name);
    if let Some(change) = &refinement.match_type_change {
        println!("    matchType {} -> {}: {}", change.from, change.to, change.reason);
    }
    for note in &refinement.notes {
        println!("    {}", note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyntest::errors::{BackendError, BatchItemFailure};

    #[test]
    fn describes_each_outcome() {
        let failed = BatchItemOutcome {
            item_id: "s1".to_string(),
            index: 0,
            status: BatchItemStatus::Failed {
                failure: BatchItemFailure::Backend(BackendError::Network("reset".to_string())),
            },
        };
        assert!(describe(&failed).starts_with("✗ s1:"));

        let cancelled = BatchItemOutcome {
            item_id: "s2".to_string(),
            index: 1,
            status: BatchItemStatus::Cancelled,
        };
        assert_eq!(describe(&cancelled), "⊘ s2: cancelled");

        let succeeded = BatchItemOutcome {
            item_id: "s3".to_string(),
            index: 2,
            status: BatchItemStatus::Succeeded {
                tests: vec![],
                rejected: vec![],
                results: vec![],
            },
        };
        assert_eq!(describe(&succeeded), "✓ s3: 0 test(s) accepted, 0 rejected");
    }
}
