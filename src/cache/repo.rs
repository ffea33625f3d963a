//! Repository cache manager
//!
//! This module provides the `RepoCache` struct which ties together all cache
//! operations for one remote repository: keeping its canonical mirror fresh,
//! materializing ref checkouts into caller-owned directories, and answering
//! ref, tag, branch and file queries from the mirror.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use super::git::{self, DEFAULT_ABBREV, GitCommands};
use super::{CachePaths, RepoLock};
use crate::config::Config;
use crate::exec::{CommandSpec, ExecResult, Executor, Invocation, NullSink, OutputSink};
use crate::types::{CacheKey, CommitSha};

/// A command-running stage of mirror maintenance or checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    MirrorClone,
    MirrorFetch,
    WorkingTreeClone,
    Checkout,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::MirrorClone => "mirror clone",
            Step::MirrorFetch => "mirror fetch",
            Step::WorkingTreeClone => "working tree clone",
            Step::Checkout => "checkout",
        };
        f.write_str(name)
    }
}

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The caller broke a precondition (empty ref, abbreviated SHA, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A git command reported failure. `output` holds what it printed.
    #[error("{step} failed: {output}")]
    CommandFailed { step: Step, output: String },
    /// Failed to acquire the mirror lock within the timeout.
    #[error("lock acquisition failed")]
    LockFailed,
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Captured command output, when the failure came from git.
    pub fn output(&self) -> Option<&str> {
        match self {
            CacheError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Answer of [`RepoCache::has_file_changed_between`].
///
/// Derived from `git diff --quiet`, which succeeds when there is no
/// difference. Any failure of that command, including an unknown commit on
/// either side, is reported as `Changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Unchanged,
    Changed,
}

impl FileChange {
    pub fn is_changed(self) -> bool {
        self == FileChange::Changed
    }
}

/// Cache manager for one remote repository.
///
/// All handles with the same [`CacheKey`] share one mirror on disk; use
/// [`RepoRegistry`](super::RepoRegistry) to share the handle itself.
pub struct RepoCache {
    url: String,
    key: CacheKey,
    paths: CachePaths,
    git: GitCommands,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn OutputSink>,
    lock_timeout: Duration,
    network_timeout: Option<Duration>,
    last_synchronized_at: Mutex<Option<SystemTime>>,
}

impl fmt::Debug for RepoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCache")
            .field("url", &self.url)
            .field("key", &self.key)
            .field("mirror", &self.mirror_path())
            .finish_non_exhaustive()
    }
}

impl RepoCache {
    /// Create a handle for `url` cached under `key`. Nothing touches disk yet.
    pub fn new(
        url: impl Into<String>,
        key: CacheKey,
        config: &Config,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            url: url.into(),
            key,
            paths: config.cache_paths(),
            git: GitCommands::new(&config.git_binary),
            executor,
            sink: Arc::new(NullSink),
            lock_timeout: config.lock_timeout,
            network_timeout: config.network_timeout,
            last_synchronized_at: Mutex::new(None),
        }
    }

    /// Stream progress and git output of clones, fetches and checkouts to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `{cache_root}/{key}`
    pub fn mirror_path(&self) -> PathBuf {
        self.paths.mirror_dir(&self.key)
    }

    /// Whether the mirror directory exists.
    pub fn is_cached(&self) -> bool {
        self.mirror_path().exists()
    }

    /// When this handle last cloned or fetched the mirror from the remote.
    pub fn last_synchronized_at(&self) -> Option<SystemTime> {
        *self
            .last_synchronized_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clone `git_ref` of the repository into `target`.
    ///
    /// Syncs the mirror, clones it into `target` (which must be absent or
    /// empty), then checks out `git_ref`. Stops at the first failing step; a
    /// failure after the clone leaves `target` partially populated.
    pub fn prepare_working_tree(&self, target: &Path, git_ref: &str) -> Result<(), CacheError> {
        git::validate_git_ref(git_ref, "git reference")?;
        let target = std::path::absolute(target)?;

        self.sink.write_line("# Beginning git repo setup");
        {
            let _lock = self.lock()?;
            self.sync_mirror_locked()?;

            self.sink.write_line(&format!(
                "# Cloning mirror into {}",
                target.display()
            ));
            let mirror = std::path::absolute(self.mirror_path())?;
            let clone = self.git.clone_local(&mirror, &target);
            self.run_step(Step::WorkingTreeClone, Invocation::new(self.paths.root(), clone))?;
        }

        self.sink.write_line(&format!("# Checking out {}", git_ref));
        self.run_step(
            Step::Checkout,
            Invocation::new(&target, self.git.checkout(git_ref)),
        )?;

        log::info!("prepared {} at {} in {}", self.key, git_ref, target.display());
        Ok(())
    }

    /// Make the mirror current: mirror clone when absent, `fetch -p` otherwise.
    pub fn sync_mirror(&self) -> Result<(), CacheError> {
        let _lock = self.lock()?;
        self.sync_mirror_locked()
    }

    /// Resolve `git_ref` to a 7 character abbreviated commit.
    ///
    /// See [`RepoCache::commit_from_ref_with_abbrev`].
    pub fn commit_from_ref(&self, git_ref: &str) -> Result<Option<String>, CacheError> {
        self.commit_from_ref_with_abbrev(git_ref, Some(DEFAULT_ABBREV))
    }

    /// Resolve `git_ref` to an abbreviated commit (`None` for the full SHA).
    ///
    /// Clones the mirror if it is missing but does not fetch an existing one,
    /// so recently pushed refs may not resolve yet. Unknown or ambiguous refs
    /// return `Ok(None)`.
    pub fn commit_from_ref_with_abbrev(
        &self,
        git_ref: &str,
        abbrev: Option<usize>,
    ) -> Result<Option<String>, CacheError> {
        git::validate_git_ref(git_ref, "git reference")?;
        if !self.ensure_cached() {
            return Ok(None);
        }

        let result = self.query(self.git.describe_long(git_ref, abbrev));
        if !result.success {
            log::debug!("could not describe {} in {}: {}", git_ref, self.key, result.text());
            return Ok(None);
        }

        Ok(git::parse_described_commit(&result.text()))
    }

    /// The tag `git describe --tags` reports for `git_ref`, if any.
    pub fn tag_from_ref(&self, git_ref: &str) -> Result<Option<String>, CacheError> {
        git::validate_git_ref(git_ref, "git reference")?;
        if !self.ensure_cached() {
            return Ok(None);
        }

        let result = self.query(self.git.describe_tags(git_ref));
        let tag = result.text();
        if !result.success || tag.is_empty() {
            return Ok(None);
        }
        Ok(Some(tag))
    }

    /// Up to 600 most recent tags, deduplicated and sorted lexically.
    ///
    /// Empty when the mirror is missing or git fails.
    pub fn tags(&self) -> Vec<String> {
        self.list(self.git.list_tags(), git::parse_tags)
    }

    /// Branch names, deduplicated and sorted lexically.
    ///
    /// Empty when the mirror is missing or git fails.
    pub fn branches(&self) -> Vec<String> {
        self.list(self.git.list_branches(), git::parse_branches)
    }

    /// Probe the remote with `ls-remote` without cloning anything.
    ///
    /// Failures are logged with git's output.
    pub fn is_valid_remote(&self) -> bool {
        if !git::is_usable_url(&self.url) {
            log::error!("Repository url '{}' is invalid: not a usable url", self.url);
            return false;
        }

        let invocation = Invocation::new(".", self.git.ls_remote_heads(&self.url))
            .with_timeout(self.network_timeout);
        let result = self.executor.execute(&invocation, &NullSink);
        if !result.success {
            log::error!("Repository url '{}' is invalid: {}", self.url, result.text());
        }
        result.success
    }

    /// Compare `file_path` between two commits with `git diff --quiet`.
    ///
    /// The diff's success signal maps to [`FileChange::Unchanged`]; every
    /// failure, including unresolvable commits, maps to [`FileChange::Changed`].
    pub fn has_file_changed_between(
        &self,
        from: &str,
        to: &str,
        file_path: &str,
    ) -> Result<FileChange, CacheError> {
        git::validate_git_ref(from, "first commit")?;
        git::validate_git_ref(to, "second commit")?;
        git::validate_file_path(file_path)?;
        self.ensure_cached();

        let result = self.query(self.git.diff_quiet(from, to, file_path));
        Ok(if result.success {
            FileChange::Unchanged
        } else {
            FileChange::Changed
        })
    }

    /// Whether `rev` names an object present in the mirror.
    ///
    /// Never syncs; false when the mirror is missing.
    pub fn contains_commit(&self, rev: &str) -> Result<bool, CacheError> {
        git::validate_git_ref(rev, "commit")?;
        if !self.is_cached() {
            return Ok(false);
        }
        Ok(self.query(self.git.cat_file_type(rev)).success)
    }

    /// Content of `file_path` at commit `sha` as text, trimmed.
    ///
    /// Line endings are preserved; bytes that are not UTF-8 are replaced with
    /// U+FFFD. Use [`RepoCache::read_file_bytes`] for the exact bytes.
    pub fn read_file_content(&self, sha: &str, file_path: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .read_file_bytes(sha, file_path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Blob bytes of `file_path` at commit `sha`, with outer ASCII whitespace trimmed.
    ///
    /// `sha` must be a full 40 character SHA. Syncs the mirror first when it is
    /// missing or does not contain the commit yet. Returns `Ok(None)` when the
    /// file does not exist at that commit or the commit is unknown.
    pub fn read_file_bytes(&self, sha: &str, file_path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let sha: CommitSha = sha.parse().map_err(|e| {
            CacheError::InvalidArgument(format!("need a full sha, but {:?} given: {}", sha, e))
        })?;
        git::validate_file_path(file_path)?;

        if !(self.is_cached() && self.object_exists(&sha)) {
            if let Err(err) = self.sync_mirror() {
                log::warn!("could not sync {} before reading {}: {}", self.key, sha, err);
            }
        }

        let result = self.query(self.git.show_blob(sha.as_str(), file_path));
        if !result.success {
            log::debug!("{}:{} not readable in {}: {}", sha, file_path, self.key, result.text());
            return Ok(None);
        }
        Ok(Some(result.stdout.trim_ascii().to_vec()))
    }

    /// Remove the mirror directory. Removing an absent mirror is not an error.
    pub fn delete_cache(&self) -> Result<(), CacheError> {
        let _lock = self.lock()?;
        let mirror = self.mirror_path();

        if remove_dir_if_present(&mirror)? {
            log::info!("removed mirror {}", mirror.display());
        }
        remove_dir_if_present(&self.paths.staging_dir(&self.key))?;

        *self
            .last_synchronized_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn sync_mirror_locked(&self) -> Result<(), CacheError> {
        // Mirror clones run from the cache root; git needs an absolute destination.
        let mirror = std::path::absolute(self.mirror_path())?;

        if mirror.exists() {
            self.sink.write_line(&format!("# Updating mirror {}", self.key));
            let invocation = Invocation::new(&mirror, self.git.fetch_prune())
                .with_timeout(self.network_timeout);
            self.run_step(Step::MirrorFetch, invocation)?;
            log::info!("fetched {} into {}", self.url, mirror.display());
        } else {
            if !git::is_usable_url(&self.url) {
                return Err(CacheError::InvalidArgument(format!(
                    "repository url {:?} cannot be cloned",
                    self.url
                )));
            }

            // The mirror path only ever holds a complete clone: clone beside it,
            // then rename into place.
            let staging = std::path::absolute(self.paths.staging_dir(&self.key))?;
            if remove_dir_if_present(&staging)? {
                log::warn!("discarded unfinished clone {}", staging.display());
            }

            self.sink.write_line(&format!("# Cloning {} into mirror {}", self.url, self.key));
            let invocation = Invocation::new(self.paths.root(), self.git.clone_mirror(&self.url, &staging))
                .with_timeout(self.network_timeout);
            if let Err(err) = self.run_step(Step::MirrorClone, invocation) {
                let _ = remove_dir_if_present(&staging);
                return Err(err);
            }
            if let Err(err) = std::fs::rename(&staging, &mirror) {
                let _ = remove_dir_if_present(&staging);
                return Err(err.into());
            }
            log::info!("cloned {} into {}", self.url, mirror.display());
        }

        *self
            .last_synchronized_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(SystemTime::now());
        Ok(())
    }

    /// Clone the mirror if it is missing. Returns whether it exists afterwards.
    fn ensure_cached(&self) -> bool {
        if self.is_cached() {
            return true;
        }
        match self.sync_mirror() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("could not create mirror {}: {}", self.key, err);
                false
            }
        }
    }

    fn object_exists(&self, sha: &CommitSha) -> bool {
        self.query(self.git.cat_file_type(sha.as_str())).success
    }

    fn list(&self, command: CommandSpec, parse: fn(&[String]) -> Vec<String>) -> Vec<String> {
        if !self.is_cached() {
            log::debug!("no mirror for {}, nothing to list", self.key);
            return Vec::new();
        }

        let result = self.query(command);
        if !result.success {
            log::debug!("listing refs of {} failed: {}", self.key, result.text());
            return Vec::new();
        }
        parse(&result.output)
    }

    /// Run a read-only command inside the mirror, capturing output only.
    fn query(&self, command: CommandSpec) -> ExecResult {
        let invocation = Invocation::new(self.mirror_path(), command);
        self.executor.execute(&invocation, &NullSink)
    }

    fn run_step(&self, step: Step, invocation: Invocation) -> Result<ExecResult, CacheError> {
        let result = self.executor.execute(&invocation, self.sink.as_ref());
        if result.success {
            Ok(result)
        } else {
            log::warn!("{} of {} failed", step, self.key);
            Err(CacheError::CommandFailed {
                step,
                output: result.text(),
            })
        }
    }

    fn lock(&self) -> Result<RepoLock, CacheError> {
        match RepoLock::acquire(&self.paths, &self.key, self.lock_timeout) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(CacheError::LockFailed),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

/// Remove a directory tree, reporting whether there was one.
fn remove_dir_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
