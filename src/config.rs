//! Process-wide settings, read once at startup and passed to the cache.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::cache::CachePaths;

/// Default wait for a mirror lock held elsewhere (5 minutes).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default bound for clones, fetches and remote checks (10 minutes).
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Settings shared by every repository handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding one mirror per cache key. Must be writable and persist
    /// across runs for caching to pay off.
    pub cache_root: PathBuf,
    /// Git executable, looked up on `PATH` unless absolute.
    pub git_binary: String,
    /// How long to wait for another process holding a mirror lock.
    pub lock_timeout: Duration,
    /// Per-command limit for operations that talk to the remote. `None` waits forever.
    pub network_timeout: Option<Duration>,
}

impl Config {
    /// Create a config rooted at `cache_root` with default timeouts.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            git_binary: "git".into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            network_timeout: Some(DEFAULT_NETWORK_TIMEOUT),
        }
    }

    /// Filesystem layout derived from the cache root.
    pub fn cache_paths(&self) -> CachePaths {
        CachePaths::new(&self.cache_root)
    }
}

impl Default for Config {
    /// Uses the system cache directory + "repocache".
    fn default() -> Self {
        Self::new(CachePaths::default().root())
    }
}

/// Command-line / environment view of [`Config`].
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory holding the repository mirrors
    #[arg(long, env = "REPOCACHE_ROOT", global = true)]
    pub cache_root: Option<PathBuf>,

    /// Git executable to run
    #[arg(long = "git", env = "REPOCACHE_GIT", default_value = "git", global = true)]
    pub git_binary: String,

    /// Seconds to wait for a mirror lock held by another process
    #[arg(long, env = "REPOCACHE_LOCK_TIMEOUT", default_value_t = DEFAULT_LOCK_TIMEOUT.as_secs(), global = true)]
    pub lock_timeout: u64,

    /// Seconds before a clone, fetch or remote check is killed (0 disables)
    #[arg(long, env = "REPOCACHE_NETWORK_TIMEOUT", default_value_t = DEFAULT_NETWORK_TIMEOUT.as_secs(), global = true)]
    pub network_timeout: u64,
}

impl ConfigArgs {
    /// Resolve into a [`Config`], falling back to the default cache root.
    pub fn into_config(self) -> Config {
        let cache_root = self
            .cache_root
            .unwrap_or_else(|| Config::default().cache_root);

        Config {
            cache_root,
            git_binary: self.git_binary,
            lock_timeout: Duration::from_secs(self.lock_timeout),
            network_timeout: match self.network_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}
