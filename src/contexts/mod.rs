pub mod batch_processor;
pub mod content_index;
pub mod context_enhancement;
pub mod execution_engine;
mod file_cache;
pub mod generation_state;
pub mod prompt_template;
pub mod refinement;
pub mod test_generator;
pub mod variable_analyzer;

pub use batch_processor::{BatchProcessor, BatchRun, DEFAULT_MAX_CONCURRENCY};
pub use content_index::{hash_content, ContentHashEntry, ContentIndex};
pub use context_enhancement::{enhance, section_metadata};
pub use execution_engine::ExecutionEngine;
pub use file_cache::{FileCache, DEFAULT_CACHE_FOLDER};
pub use generation_state::{
    GenerationHistory, GenerationState, HistoryEntry, HistoryOutcome, DEFAULT_HISTORY_CAPACITY,
};
pub use refinement::{MatchTypeChange, Refinement, RefinementService};
pub use test_generator::{GeneratedTests, GenerationStep, TestGenerator};
pub use variable_analyzer::{analyze, has_style_effects};
