mod analysis;
mod cache;
mod context;
mod evaluator;
mod generation;
mod section;

pub use analysis::{AnalysisResult, VariableCategory, VariableInfo};
pub use cache::Cache;
pub use context::{DomainContext, EnrichedContext, EntitySummary, SectionMetadata};
pub use evaluator::Evaluator;
pub use generation::{
    AITestRequest, AITestResponse, BatchGenerationProgress, BatchGenerationRequest, BatchItem,
    BatchItemOutcome, BatchItemStatus, CandidateTest, GeneratedTest, ProviderMetadata,
    RejectedCandidate, RequestMode, TestQualityMetrics, SUB_SCORE_COVERAGE,
    SUB_SCORE_EDGE_CASES, SUB_SCORE_SPECIFICITY,
};
pub use section::{
    compile_pattern, MatchType, Matcher, Section, SectionKind, SectionTestResult, SummaryCounts, TestCase,
    TestResult, TestSummary,
};
