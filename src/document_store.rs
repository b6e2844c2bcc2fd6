//! Persistence for documents: ordered sections, their test cases and the
//! content-hash index.
//!
//! Documents are stored as a single JSON or YAML file, chosen by extension.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contexts::{ContentHashEntry, ContentIndex};
use crate::data::{DomainContext, Section, TestCase};
use crate::errors::StoreError;

/// A document of sections as authored in the product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub context: DomainContext,
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Persisted snapshot of the dedup index, keyed by content hash
    #[serde(default)]
    pub content_hashes: BTreeMap<String, ContentHashEntry>,
}

impl Document {
    pub fn section(&self, section_id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == section_id)
    }

    pub fn section_mut(&mut self, section_id: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id == section_id)
    }

    /// Appends test cases to a section. Cases whose name is already taken in
    /// that section are skipped. Returns how many were appended.
    pub fn append_tests(
        &mut self,
        section_id: &str,
        tests: impl IntoIterator<Item = TestCase>,
    ) -> Result<usize, StoreError> {
        let section = self
            .section_mut(section_id)
            .ok_or_else(|| StoreError::SectionNotFound(section_id.to_string()))?;

        let mut names: BTreeSet<String> = section.tests.iter().map(|t| t.name.clone()).collect();
        let mut appended = 0;
        for test in tests {
            if !names.insert(test.name.clone()) {
                debug!(section = section_id, test = %test.name, "skipping duplicate test name");
                continue;
            }
            section.tests.push(test);
            appended += 1;
        }
        Ok(appended)
    }

    /// Replaces the test case called `name` in a section, keeping its position
    pub fn replace_test(&mut self, section_id: &str, name: &str, test: TestCase) -> Result<(), StoreError> {
        let section = self
            .section_mut(section_id)
            .ok_or_else(|| StoreError::SectionNotFound(section_id.to_string()))?;
        let slot = section
            .tests
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| StoreError::TestNotFound {
                section: section_id.to_string(),
                test: name.to_string(),
            })?;
        *slot = test;
        Ok(())
    }

    /// Removes a section and releases its content hash in `index`
    pub fn remove_section(&mut self, section_id: &str, index: &ContentIndex) -> Result<Section, StoreError> {
        let position = self
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .ok_or_else(|| StoreError::SectionNotFound(section_id.to_string()))?;
        let section = self.sections.remove(position);
        index.release_section(section_id);
        self.sync_index(index);
        Ok(section)
    }

    /// Restores the dedup index from the persisted snapshot and reconciles it
    /// with the current sections: changed content moves to its new hash and
    /// owners that are no longer in the document are released.
    pub fn build_index(&self) -> ContentIndex {
        let index = ContentIndex::from_entries(self.content_hashes.clone());
        for section in &self.sections {
            index.register(&section.id, &section.content);
        }

        let live: BTreeSet<&str> = self.sections.iter().map(|s| s.id.as_str()).collect();
        let stale: Vec<String> = index
            .snapshot()
            .into_values()
            .flat_map(|entry| entry.owners)
            .filter(|owner| !live.contains(owner.as_str()))
            .collect();
        for owner in stale {
            debug!(section = %owner, "releasing hash of a section no longer in the document");
            index.release_section(&owner);
        }
        index
    }

    /// Copies the index state back into the document for persistence
    pub fn sync_index(&mut self, index: &ContentIndex) {
        self.content_hashes = index.snapshot();
    }
}

/// Storage for a single document
pub trait DocumentStore: Send + Sync {
    fn load(&self) -> Result<Document, StoreError>;
    fn save(&self, document: &Document) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

/// A document kept in one file; `.yml`/`.yaml` files are YAML, anything else JSON
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    path: PathBuf,
}

impl FileDocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> Format {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Format::Yaml,
            _ => Format::Json,
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn parse_error(&self, message: String) -> StoreError {
        StoreError::Parse {
            path: self.path.display().to_string(),
            message,
        }
    }
}

impl DocumentStore for FileDocumentStore {
    fn load(&self) -> Result<Document, StoreError> {
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let document: Document = match self.format() {
            Format::Json => serde_json::from_str(&content).map_err(|e| self.parse_error(e.to_string()))?,
            Format::Yaml => serde_yaml::from_str(&content).map_err(|e| self.parse_error(e.to_string()))?,
        };
        debug!(path = %self.path.display(), sections = document.sections.len(), "loaded document");
        Ok(document)
    }

    /// Writes the whole document to a sibling temp file, then renames it over
    /// the original
    fn save(&self, document: &Document) -> Result<(), StoreError> {
        let content = match self.format() {
            Format::Json => serde_json::to_string_pretty(document).map_err(|e| self.parse_error(e.to_string()))?,
            Format::Yaml => serde_yaml::to_string(document).map_err(|e| self.parse_error(e.to_string()))?,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        info!(path = %self.path.display(), sections = document.sections.len(), "saved document");
        Ok(())
    }
}
