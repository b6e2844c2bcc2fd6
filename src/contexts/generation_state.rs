//! Process-scoped generation state read by the presentation layer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::{AITestRequest, AITestResponse, BatchGenerationProgress};
use crate::errors::BackendError;
use crate::registries::ProjectConfig;

use super::test_generator::GenerationStep;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum HistoryOutcome {
    Response(AITestResponse),
    Error(BackendError),
}

/// One past backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub section_id: String,
    pub request: AITestRequest,
    pub outcome: HistoryOutcome,
}

/// Append-only log that keeps the newest `capacity` entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl GenerationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        // A deserialized history may carry a zero capacity.
        let capacity = self.capacity();
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.max(1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
struct Inner {
    last_response: Option<AITestResponse>,
    history: GenerationHistory,
    batch_progress: Option<BatchGenerationProgress>,
    config: Option<ProjectConfig>,
    last_error: Option<String>,
}

/// Shared by batch workers; every access takes the one lock
#[derive(Debug)]
pub struct GenerationState {
    inner: Mutex<Inner>,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl GenerationState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_response: None,
                history: GenerationHistory::new(history_capacity),
                batch_progress: None,
                config: None,
                last_error: None,
            }),
        }
    }

    pub fn with_config(config: ProjectConfig) -> Self {
        let state = Self::new(config.history_capacity);
        state.lock().config = Some(config);
        state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one backend call to the history and updates the last
    /// response or last error. Returns the new entry's id.
    pub fn record(&self, section_id: &str, request: &AITestRequest, outcome: HistoryOutcome) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        match &outcome {
            HistoryOutcome::Response(response) => {
                inner.last_response = Some(response.clone());
                inner.last_error = None;
            }
            HistoryOutcome::Error(error) => inner.last_error = Some(error.to_string()),
        }
        inner.history.push(HistoryEntry {
            id,
            timestamp: Utc::now(),
            section_id: section_id.to_string(),
            request: request.clone(),
            outcome,
        });
        id
    }

    pub fn record_step(&self, step: &GenerationStep) -> Uuid {
        let outcome = match &step.result {
            Ok(generated) => HistoryOutcome::Response(generated.response.clone()),
            Err(error) => HistoryOutcome::Error(error.clone()),
        };
        self.record(&step.section_id, &step.request, outcome)
    }

    /// Records a failure that did not come from a backend call
    pub fn set_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    pub fn set_batch_progress(&self, progress: Option<BatchGenerationProgress>) {
        self.lock().batch_progress = progress;
    }

    pub fn batch_progress(&self) -> Option<BatchGenerationProgress> {
        self.lock().batch_progress.clone()
    }

    pub fn last_response(&self) -> Option<AITestResponse> {
        self.lock().last_response.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn config(&self) -> Option<ProjectConfig> {
        self.lock().config.clone()
    }

    pub fn history(&self) -> GenerationHistory {
        self.lock().history.clone()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }
}
