// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent, content-hash-keyed cache of document symbol results.
//!
//! Entries are keyed by `(relative path, include_body)` and validated
//! against the current buffer hash; a stale entry is treated as absent and
//! overwritten once the server answers. The map is persisted as versioned
//! JSON under the repository; the schema version is baked into the
//! filename, so a schema change looks like a missing cache and causes a
//! fresh start. Concurrent processes on the same repository resolve to
//! last-writer-wins via an atomic rename; no locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::symbols::SymbolTree;

/// Name of the cache file; bump the `v` suffix on schema changes.
const CACHE_FILE: &str = "document_symbols_cache-v1.json";

/// Directory under the repository root holding facade state.
const STATE_DIR: &str = ".unilsp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    content_hash: String,
    tree: SymbolTree,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
}

/// In-memory symbol cache with persistence.
///
/// One short-held mutex guards reads, writes and the dirty flag; no
/// server request is ever issued while it is held.
#[derive(Debug)]
pub struct SymbolCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

fn cache_key(relative_path: &str, include_body: bool) -> String {
    format!("{relative_path}-{include_body}")
}

impl SymbolCache {
    /// Creates the cache for a repository and loads any persisted entries.
    /// A corrupt or unreadable cache file is logged and discarded.
    #[must_use]
    pub fn load(repository_root: &Path) -> Self {
        let path = repository_root.join(STATE_DIR).join("cache").join(CACHE_FILE);
        let cache = Self {
            path,
            state: Mutex::new(CacheState::default()),
        };
        cache.load_from_disk();
        cache
    }

    /// Returns the cached tree for the key iff its stored hash equals
    /// `content_hash`.
    #[must_use]
    pub fn lookup(
        &self,
        relative_path: &str,
        include_body: bool,
        content_hash: &str,
    ) -> Option<SymbolTree> {
        let state = self.state.lock().ok()?;
        let entry = state.entries.get(&cache_key(relative_path, include_body))?;
        if entry.content_hash == content_hash {
            debug!(path = relative_path, "Symbol cache hit");
            Some(entry.tree.clone())
        } else {
            debug!(path = relative_path, "Symbol cache stale, will overwrite");
            None
        }
    }

    /// Stores a fresh result, marking the cache dirty.
    pub fn insert(
        &self,
        relative_path: &str,
        include_body: bool,
        content_hash: String,
        tree: SymbolTree,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.insert(
                cache_key(relative_path, include_body),
                CacheEntry { content_hash, tree },
            );
            state.dirty = true;
        }
    }

    /// Persists the cache atomically if it changed since the last save.
    /// Serialization failures are logged and swallowed; the in-memory
    /// state stays authoritative.
    pub fn save(&self) {
        let serialized = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !state.dirty {
                debug!("Symbol cache unchanged, skipping save");
                return;
            }
            match serde_json::to_vec(&state.entries) {
                Ok(bytes) => {
                    state.dirty = false;
                    bytes
                }
                Err(e) => {
                    error!("Failed to serialize symbol cache: {e}");
                    return;
                }
            }
        };

        if let Err(e) = self.write_atomically(&serialized) {
            error!(path = %self.path.display(), "Failed to save symbol cache: {e}");
            if let Ok(mut state) = self.state.lock() {
                state.dirty = true;
            }
        } else {
            info!(path = %self.path.display(), "Saved symbol cache");
        }
    }

    fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn load_from_disk(&self) {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        match serde_json::from_slice::<HashMap<String, CacheEntry>>(&bytes) {
            Ok(entries) => {
                info!(
                    count = entries.len(),
                    path = %self.path.display(),
                    "Loaded symbol cache"
                );
                if let Ok(mut state) = self.state.lock() {
                    state.entries = entries;
                    state.dirty = false;
                }
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    "Failed to load symbol cache, starting fresh (possibly corrupt): {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::UriPathMapper;
    use crate::symbols::SymbolNode;
    use anyhow::Result;
    use lsp_types::{Position, Range, SymbolKind};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_tree() -> SymbolTree {
        let mut tree = SymbolTree::new();
        let range = Range::new(Position::new(0, 0), Position::new(2, 0));
        let mapper = UriPathMapper::new(PathBuf::from("/repo"));
        let id = tree.push(SymbolNode {
            name: "f".to_string(),
            kind: SymbolKind::FUNCTION,
            range,
            selection_range: range,
            location: mapper.location_for_relative("a.py", range),
            body: None,
            children: Vec::new(),
            parent: None,
        });
        tree.add_root(id);
        tree
    }

    #[test]
    fn lookup_validates_hash() -> Result<()> {
        let repo = TempDir::new()?;
        let cache = SymbolCache::load(repo.path());

        cache.insert("a.py", false, "hash1".to_string(), sample_tree());
        assert!(cache.lookup("a.py", false, "hash1").is_some());
        assert!(cache.lookup("a.py", false, "hash2").is_none());
        assert!(cache.lookup("a.py", true, "hash1").is_none());
        assert!(cache.lookup("b.py", false, "hash1").is_none());
        Ok(())
    }

    #[test]
    fn save_and_reload() -> Result<()> {
        let repo = TempDir::new()?;
        {
            let cache = SymbolCache::load(repo.path());
            cache.insert("a.py", false, "hash1".to_string(), sample_tree());
            cache.save();
        }

        let reloaded = SymbolCache::load(repo.path());
        let tree = reloaded.lookup("a.py", false, "hash1");
        assert_eq!(tree.map(|t| t.len()), Some(1));
        Ok(())
    }

    #[test]
    fn save_skipped_when_clean() -> Result<()> {
        let repo = TempDir::new()?;
        let cache = SymbolCache::load(repo.path());
        cache.save();
        assert!(!repo.path().join(STATE_DIR).join("cache").join(CACHE_FILE).exists());
        Ok(())
    }

    #[test]
    fn corrupt_cache_starts_fresh() -> Result<()> {
        let repo = TempDir::new()?;
        let cache_dir = repo.path().join(STATE_DIR).join("cache");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::write(cache_dir.join(CACHE_FILE), b"{ not json")?;

        let cache = SymbolCache::load(repo.path());
        assert!(cache.lookup("a.py", false, "hash1").is_none());
        Ok(())
    }
}
