//! Content-addressed tracking of identical section content.
//!
//! Sections with byte-identical content (after normalization) share one
//! entry, so analysis and generation work can be reused between them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One distinct piece of content and the sections that carry it.
///
/// `occurrences` always equals `owners.len()`; entries that reach zero are
/// removed from the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashEntry {
    pub content: String,
    pub occurrences: usize,
    pub owners: BTreeSet<String>,
}

/// Hashes content after normalizing line endings and trailing whitespace
pub fn hash_content(content: &str) -> String {
    let normalized = normalize(content);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[derive(Debug, Default)]
struct IndexState {
    entries: BTreeMap<String, ContentHashEntry>,
    /// section id -> hash it currently owns
    by_section: HashMap<String, String>,
}

impl IndexState {
    fn release(&mut self, section_id: &str, hash: &str) -> bool {
        let Some(entry) = self.entries.get_mut(hash) else {
            return false;
        };
        if !entry.owners.remove(section_id) {
            return false;
        }
        entry.occurrences = entry.owners.len();
        if entry.occurrences == 0 {
            self.entries.remove(hash);
        }
        self.by_section.remove(section_id);
        true
    }
}

/// Thread-safe dedup index; every mutation happens under one lock
#[derive(Debug, Default)]
pub struct ContentIndex {
    state: Mutex<IndexState>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an index from persisted entries. Occurrence counts are
    /// recomputed from the owner sets and empty entries are dropped.
    pub fn from_entries(entries: BTreeMap<String, ContentHashEntry>) -> Self {
        let mut state = IndexState::default();
        for (hash, mut entry) in entries {
            entry.occurrences = entry.owners.len();
            if entry.occurrences == 0 {
                continue;
            }
            for owner in &entry.owners {
                state.by_section.insert(owner.clone(), hash.clone());
            }
            state.entries.insert(hash, entry);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `section_id` carries `content` and returns the content hash.
    ///
    /// Registering the same pair twice is a no-op. If the section previously
    /// owned a different hash, that ownership is released first.
    pub fn register(&self, section_id: &str, content: &str) -> String {
        let hash = hash_content(content);
        let mut state = self.lock();

        match state.by_section.get(section_id).cloned() {
            Some(current) if current == hash => return hash,
            Some(previous) => {
                debug!(section = section_id, hash = %previous, "content changed, releasing old hash");
                state.release(section_id, &previous);
            }
            None => {}
        }

        let entry = state
            .entries
            .entry(hash.clone())
            .or_insert_with(|| ContentHashEntry {
                content: content.to_string(),
                occurrences: 0,
                owners: BTreeSet::new(),
            });
        entry.owners.insert(section_id.to_string());
        entry.occurrences = entry.owners.len();
        state.by_section.insert(section_id.to_string(), hash.clone());
        hash
    }

    /// Drops `section_id`'s ownership of `hash`.
    ///
    /// # Panics
    /// If the section does not own the hash. That is a caller bug.
    pub fn release(&self, section_id: &str, hash: &str) {
        let released = self.lock().release(section_id, hash);
        if !released {
            panic!(
                "release called for section '{}' on hash {} it does not own",
                section_id, hash
            );
        }
    }

    /// Releases whatever hash the section owns, if any. Used when a section
    /// is deleted and the caller does not track its hash.
    pub fn release_section(&self, section_id: &str) -> Option<String> {
        let mut state = self.lock();
        let hash = state.by_section.get(section_id).cloned()?;
        state.release(section_id, &hash);
        Some(hash)
    }

    pub fn hash_of(&self, section_id: &str) -> Option<String> {
        self.lock().by_section.get(section_id).cloned()
    }

    pub fn entry(&self, hash: &str) -> Option<ContentHashEntry> {
        self.lock().entries.get(hash).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ContentHashEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_invariant(index: &ContentIndex) {
        for (hash, entry) in index.snapshot() {
            assert_eq!(entry.occurrences, entry.owners.len(), "hash {}", hash);
            assert!(entry.occurrences > 0, "garbage entry {}", hash);
        }
    }

    #[test]
    fn shared_content_scenario() {
        let index = ContentIndex::new();
        let h1 = index.register("s1", "A");
        let h2 = index.register("s2", "A");
        assert_eq!(h1, h2);
        assert_eq!(index.len(), 1);

        let entry = index.entry(&h1).unwrap();
        assert_eq!(entry.occurrences, 2);
        assert_eq!(entry.owners, BTreeSet::from(["s1".to_string(), "s2".to_string()]));

        index.release("s1", &h1);
        let entry = index.entry(&h1).unwrap();
        assert_eq!(entry.occurrences, 1);
        assert_eq!(entry.owners, BTreeSet::from(["s2".to_string()]));

        index.release("s2", &h1);
        assert!(index.entry(&h1).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn register_is_idempotent() {
        let index = ContentIndex::new();
        let hash = index.register("s1", "Hello");
        index.register("s1", "Hello");
        assert_eq!(index.entry(&hash).unwrap().occurrences, 1);
    }

    #[test]
    fn changed_content_moves_ownership() {
        let index = ContentIndex::new();
        let old = index.register("s1", "before");
        let new = index.register("s1", "after");
        assert_ne!(old, new);
        assert!(index.entry(&old).is_none());
        assert_eq!(index.hash_of("s1"), Some(new));
        assert_invariant(&index);
    }

    #[test]
    fn normalization_ignores_line_endings_and_trailing_space() {
        assert_eq!(hash_content("a  \r\nb\n"), hash_content("a\nb"));
        assert_ne!(hash_content("a b"), hash_content("a  b"));
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn release_without_ownership_panics() {
        let index = ContentIndex::new();
        let hash = index.register("s1", "A");
        index.release("s2", &hash);
    }

    #[test]
    fn invariant_holds_over_mixed_operations() {
        let index = ContentIndex::new();
        let contents = ["A", "B", "C"];
        let mut seed: u64 = 7;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let section = format!("s{}", (seed >> 33) % 6);
            if (seed >> 20) % 3 == 0 {
                index.release_section(&section);
            } else {
                index.register(&section, contents[((seed >> 40) % 3) as usize]);
            }
            assert_invariant(&index);
        }
    }

    #[test]
    fn concurrent_registration_is_serialized() {
        let index = Arc::new(ContentIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    index.register(&format!("s{}", i), "shared");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let entry = index.entry(&hash_content("shared")).unwrap();
        assert_eq!(entry.occurrences, 8);
    }

    #[test]
    fn rebuild_from_entries_recomputes_counts() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "h1".to_string(),
            ContentHashEntry {
                content: "A".to_string(),
                occurrences: 5,
                owners: BTreeSet::from(["s1".to_string()]),
            },
        );
        entries.insert(
            "h2".to_string(),
            ContentHashEntry {
                content: "B".to_string(),
                occurrences: 1,
                owners: BTreeSet::new(),
            },
        );
        let index = ContentIndex::from_entries(entries);
        assert_eq!(index.len(), 1);
        assert_eq!(index.entry("h1").unwrap().occurrences, 1);
        assert_eq!(index.hash_of("s1"), Some("h1".to_string()));
    }
}
