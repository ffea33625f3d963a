//! Mirror cache: one bare mirror per cache key, cloned into working trees on demand.

mod git;
mod lock;
mod paths;
mod registry;
mod repo;

pub use git::{DEFAULT_ABBREV, GitCommands, parse_branches, parse_described_commit, parse_tags};
pub use lock::RepoLock;
pub use paths::CachePaths;
pub use registry::RepoRegistry;
pub use repo::{CacheError, FileChange, RepoCache, Step};
