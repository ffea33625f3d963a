//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! ~/.cache/repocache/
//! ├── <cache-key>/                  # Mirror clone (bare, all refs)
//! ├── <other-key>/
//! ├── .tmp-<cache-key>/             # Mirror clone in progress
//! └── .locks/
//!     └── <cache-key>.lock          # flock-based locking
//! ```
//!
//! Nothing but git's own files is ever written inside a mirror directory.

use std::path::{Path, PathBuf};

use crate::types::CacheKey;

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the mirror directory for a repository: `{root}/{key}`
    pub fn mirror_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Returns the directory a first mirror clone is written to: `{root}/.tmp-{key}`
    ///
    /// It is renamed to [`CachePaths::mirror_dir`] once the clone completes.
    pub fn staging_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!(".tmp-{}", key.as_str()))
    }

    /// Returns the locks directory path: `{root}/.locks`
    ///
    /// Cache keys cannot start with a dot, so this never collides with a mirror.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    /// Returns the lock file path: `{root}/.locks/{key}.lock`
    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key.as_str()))
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "repocache"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("repocache"))
    }
}
