//! Git command construction and output parsing.
//!
//! Every git call the cache makes is built here as a structured argument list
//! and run through an [`Executor`](crate::exec::Executor); nothing is ever
//! interpolated into a shell string. Commands that may reach the network get
//! the same hardening:
//! - `GIT_TERMINAL_PROMPT=0` - never block on an interactive prompt
//! - `-c core.askpass=true` - credential prompts answer empty and fail fast

use std::collections::BTreeSet;
use std::path::Path;

use super::CacheError;
use crate::exec::CommandSpec;

/// Abbreviation length used when a caller does not ask for one.
pub const DEFAULT_ABBREV: usize = 7;

/// Upper bound on tags listed, newest first, before lexical sorting.
const TAG_LIMIT: usize = 600;

/// Validate that a git ref (branch, tag or commit) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (ranges and path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub(crate) fn validate_git_ref(value: &str, name: &str) -> Result<(), CacheError> {
    if value.is_empty() {
        return Err(CacheError::InvalidArgument(format!("{} is required", name)));
    }
    if value.contains("..") {
        return Err(CacheError::InvalidArgument(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(CacheError::InvalidArgument(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if has_control_chars(value) {
        return Err(CacheError::InvalidArgument(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a path inside the repository used for diffs and blob reads.
pub(crate) fn validate_file_path(value: &str) -> Result<(), CacheError> {
    if value.is_empty() {
        return Err(CacheError::InvalidArgument("file path is required".into()));
    }
    if has_control_chars(value) {
        return Err(CacheError::InvalidArgument(
            "file path cannot contain null or control characters".into(),
        ));
    }
    Ok(())
}

/// Whether a remote URL can be handed to git as a positional argument.
pub(crate) fn is_usable_url(url: &str) -> bool {
    !url.trim().is_empty() && !url.starts_with('-') && !has_control_chars(url)
}

fn has_control_chars(value: &str) -> bool {
    value.bytes().any(|b| b < 0x20 || b == 0x7f)
}

/// Builds the git command lines used by the cache.
#[derive(Debug, Clone)]
pub struct GitCommands {
    git_path: String,
}

impl Default for GitCommands {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCommands {
    /// Use the given git executable.
    pub fn new(git_path: impl Into<String>) -> Self {
        Self {
            git_path: git_path.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.git_path).env("GIT_TERMINAL_PROMPT", "0")
    }

    fn network_command(&self) -> CommandSpec {
        self.command().args(["-c", "core.askpass=true"])
    }

    /// `git clone --mirror <url> <dest>`: all refs, no working tree.
    pub fn clone_mirror(&self, url: &str, dest: &Path) -> CommandSpec {
        self.network_command()
            .args(["clone", "--mirror", "--"])
            .arg(url)
            .arg(dest)
    }

    /// `git fetch -p`, run inside the mirror.
    pub fn fetch_prune(&self) -> CommandSpec {
        self.network_command().args(["fetch", "-p"])
    }

    /// `git clone <mirror> <dest>`: local clone with a working tree.
    pub fn clone_local(&self, source: &Path, dest: &Path) -> CommandSpec {
        self.command()
            .args(["clone", "--"])
            .arg(source)
            .arg(dest)
    }

    /// `git checkout --quiet <ref>`, run inside a working tree.
    pub fn checkout(&self, git_ref: &str) -> CommandSpec {
        self.command().args(["checkout", "--quiet"]).arg(git_ref)
    }

    /// `git ls-remote -h <url>`: cheap reachability check.
    pub fn ls_remote_heads(&self, url: &str) -> CommandSpec {
        self.network_command().args(["ls-remote", "-h"]).arg(url)
    }

    /// Tag names, newest author date first, capped at 600.
    pub fn list_tags(&self) -> CommandSpec {
        self.command().args([
            "for-each-ref".to_string(),
            "refs/tags".to_string(),
            "--sort=-authordate".to_string(),
            "--format=%(refname)".to_string(),
            format!("--count={}", TAG_LIMIT),
        ])
    }

    /// `git branch --list --no-color --no-column`
    pub fn list_branches(&self) -> CommandSpec {
        self.command()
            .args(["branch", "--list", "--no-color", "--no-column"])
    }

    /// `git diff --quiet --name-only <a>..<b> -- <path>`: exits non-zero when the path differs.
    pub fn diff_quiet(&self, from: &str, to: &str, path: &str) -> CommandSpec {
        self.command()
            .args(["diff", "--quiet", "--name-only"])
            .arg(format!("{}..{}", from, to))
            .arg("--")
            .arg(path)
    }

    /// `git show <sha>:<path>`: raw blob content.
    pub fn show_blob(&self, sha: &str, path: &str) -> CommandSpec {
        self.command().arg("show").arg(format!("{}:{}", sha, path))
    }

    /// `git cat-file -t <sha>`: succeeds only when the object is present locally.
    pub fn cat_file_type(&self, sha: &str) -> CommandSpec {
        self.command().args(["cat-file", "-t"]).arg(sha)
    }

    /// `git describe --long --tags --all --abbrev=<n> <ref>`; `None` asks for full SHAs.
    pub fn describe_long(&self, git_ref: &str, abbrev: Option<usize>) -> CommandSpec {
        self.command()
            .args(["describe", "--long", "--tags", "--all"])
            .arg(format!("--abbrev={}", abbrev.unwrap_or(40)))
            .arg(git_ref)
    }

    /// `git describe --tags <ref>`
    pub fn describe_tags(&self, git_ref: &str) -> CommandSpec {
        self.command().args(["describe", "--tags"]).arg(git_ref)
    }
}

/// Extract the commit from a `<base>-<n>-g<sha>` description.
///
/// Takes the last `-` separated segment and strips one leading `g`.
pub fn parse_described_commit(description: &str) -> Option<String> {
    let last = description.trim().rsplit('-').next()?;
    let sha = last.strip_prefix('g').unwrap_or(last);
    if sha.is_empty() {
        None
    } else {
        Some(sha.to_string())
    }
}

/// Turn `for-each-ref` output into unique tag names in ascending order.
pub fn parse_tags<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    sorted_unique(
        lines
            .iter()
            .map(|line| line.as_ref().replace("refs/tags/", "").trim().to_string()),
    )
}

/// Turn `git branch` output into unique branch names in ascending order.
pub fn parse_branches<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    sorted_unique(lines.iter().map(|line| {
        let line = line.as_ref().trim();
        line.strip_prefix('*')
            .or_else(|| line.strip_prefix('+'))
            .unwrap_or(line)
            .trim()
            .to_string()
    }))
}

fn sorted_unique(names: impl Iterator<Item = String>) -> Vec<String> {
    names
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
