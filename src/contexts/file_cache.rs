use crate::data::Cache;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default root folder for cached backend responses
pub const DEFAULT_CACHE_FOLDER: &str = ".dyntest";

/// FileCache is an implementation of the Cache trait that stores backend
/// responses in a file structure.
///
/// The cache is organized as: `{folder}/{namespace}/{key}.cache`
/// where namespace = hash(provider + model + prompt template), so changing any
/// of them starts from an empty cache.
#[derive(Debug, Clone)]
pub struct FileCache {
    /// The root folder path for the cache (defaults to ".dyntest")
    folder: PathBuf,
    namespace: String,
}

impl FileCache {
    /// Creates a new FileCache instance
    ///
    /// # Arguments
    /// * `folder` - Optional root folder path. If None, defaults to ".dyntest"
    /// * `namespace` - Hash identifying provider, model and prompt (used as subfolder)
    pub fn new(folder: Option<PathBuf>, namespace: String) -> Self {
        Self {
            folder: folder.unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FOLDER)),
            namespace,
        }
    }

    /// Path format: `{folder}/{namespace}/{key}.cache`.
    /// Keys are hex hashes and already safe for filenames.
    fn get_cache_path(&self, key: &str) -> PathBuf {
        self.get_cache_dir().join(format!("{}.cache", key))
    }

    fn get_cache_dir(&self) -> PathBuf {
        self.folder.join(&self.namespace)
    }

    /// Removes every cached response under `folder`. Returns the number of files removed.
    pub fn clear(folder: &Path) -> std::io::Result<usize> {
        if !folder.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for namespace in fs::read_dir(folder)? {
            let namespace = namespace?.path();
            if !namespace.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&namespace)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "cache") {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
            // Leave the namespace directory if something else lives there.
            let _ = fs::remove_dir(&namespace);
        }
        Ok(removed)
    }
}

impl Cache for FileCache {
    fn get(&self, key: &str) -> Option<String> {
        // Missing file or read error is a cache miss.
        fs::read_to_string(self.get_cache_path(key)).ok()
    }

    fn set(&self, key: &str, value: &str) {
        let path = self.get_cache_path(key);
        let dir = self.get_cache_dir();

        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "failed to create cache directory");
            return;
        }

        if let Err(e) = fs::write(&path, value) {
            warn!(path = %path.display(), error = %e, "failed to write cache file");
        }
    }
}
