use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use repocache::cache::{CachePaths, RepoCache};
use repocache::config::{Config, ConfigArgs};
use repocache::exec::{ProcessExecutor, WriterSink};
use repocache::types::CacheKey;

#[derive(Parser)]
#[command(
    name = "repocache",
    about = "Shared git mirror cache - check out any ref without re-cloning"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Which repository to operate on.
#[derive(Args)]
struct RepoArgs {
    /// Remote repository URL
    #[arg(long, env = "REPOCACHE_URL")]
    url: String,

    /// Cache key, used as the mirror directory name
    #[arg(long)]
    name: CacheKey,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out a ref into a fresh directory, via the mirror
    Prepare {
        #[command(flatten)]
        repo: RepoArgs,
        /// Directory to clone into (absent or empty)
        target: PathBuf,
        /// Branch, tag or commit to check out
        git_ref: String,
    },

    /// Clone or fetch the mirror
    Sync {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Resolve a ref to an abbreviated commit
    Commit {
        #[command(flatten)]
        repo: RepoArgs,
        git_ref: String,
        /// Abbreviation length
        #[arg(long, default_value_t = repocache::cache::DEFAULT_ABBREV, conflicts_with = "full")]
        abbrev: usize,
        /// Print the full 40 character SHA
        #[arg(long)]
        full: bool,
    },

    /// Show the tag describing a ref
    Tag {
        #[command(flatten)]
        repo: RepoArgs,
        git_ref: String,
    },

    /// List tags of the mirror
    Tags {
        #[command(flatten)]
        repo: RepoArgs,
        /// Print a JSON array
        #[arg(long)]
        json: bool,
    },

    /// List branches of the mirror
    Branches {
        #[command(flatten)]
        repo: RepoArgs,
        /// Print a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Check that the remote is reachable
    Check {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Exit 0 when a file differs between two commits, 1 when it does not
    /// or either commit is unknown
    Changed {
        #[command(flatten)]
        repo: RepoArgs,
        from: String,
        to: String,
        path: String,
    },

    /// Print a file at a commit
    Show {
        #[command(flatten)]
        repo: RepoArgs,
        /// Full 40 character commit SHA
        sha: String,
        path: String,
    },

    /// Remove the mirror
    Clean {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Check dependencies
    Doctor,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.config.into_config();

    let result = match cli.command {
        Commands::Prepare {
            repo,
            target,
            git_ref,
        } => cmd_prepare(&config, repo, &target, &git_ref),
        Commands::Sync { repo } => cmd_sync(&config, repo),
        Commands::Commit {
            repo,
            git_ref,
            abbrev,
            full,
        } => cmd_commit(&config, repo, &git_ref, (!full).then_some(abbrev)),
        Commands::Tag { repo, git_ref } => cmd_tag(&config, repo, &git_ref),
        Commands::Tags { repo, json } => {
            let cache = open(&config, repo);
            cmd_list(&cache, cache.tags(), json)
        }
        Commands::Branches { repo, json } => {
            let cache = open(&config, repo);
            cmd_list(&cache, cache.branches(), json)
        }
        Commands::Check { repo } => cmd_check(&config, repo),
        Commands::Changed {
            repo,
            from,
            to,
            path,
        } => cmd_changed(&config, repo, &from, &to, &path),
        Commands::Show { repo, sha, path } => cmd_show(&config, repo, &sha, &path),
        Commands::Clean { repo } => cmd_clean(&config, repo),
        Commands::Doctor => cmd_doctor(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open(config: &Config, repo: RepoArgs) -> RepoCache {
    RepoCache::new(
        repo.url,
        repo.name,
        config,
        Arc::new(ProcessExecutor::new()),
    )
    .with_sink(Arc::new(WriterSink::stderr()))
}

fn cmd_prepare(
    config: &Config,
    repo: RepoArgs,
    target: &std::path::Path,
    git_ref: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    cache.prepare_working_tree(target, git_ref)?;
    println!("{}", target.display());
    Ok(())
}

fn cmd_sync(config: &Config, repo: RepoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    cache.sync_mirror()?;
    eprintln!("Synced {}", cache.mirror_path().display());
    Ok(())
}

fn cmd_commit(
    config: &Config,
    repo: RepoArgs,
    git_ref: &str,
    abbrev: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    let commit = cache
        .commit_from_ref_with_abbrev(git_ref, abbrev)?
        .ok_or_else(|| format!("could not resolve {}", git_ref))?;
    println!("{}", commit);
    Ok(())
}

fn cmd_tag(config: &Config, repo: RepoArgs, git_ref: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    let tag = cache
        .tag_from_ref(git_ref)?
        .ok_or_else(|| format!("no tag describes {}", git_ref))?;
    println!("{}", tag);
    Ok(())
}

/// `--json` shape of `tags` and `branches`.
#[derive(Serialize)]
struct RefListing<'a> {
    name: &'a str,
    url: &'a str,
    refs: &'a [String],
}

fn cmd_list(
    cache: &RepoCache,
    names: Vec<String>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        let listing = RefListing {
            name: cache.key().as_str(),
            url: cache.url(),
            refs: &names,
        };
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if names.is_empty() {
        return Err("nothing found (is the repository cached?)".into());
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn cmd_check(config: &Config, repo: RepoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    if !cache.is_valid_remote() {
        return Err(format!("{} is not a reachable repository", cache.url()).into());
    }
    println!("{} is reachable", cache.url());
    Ok(())
}

fn cmd_changed(
    config: &Config,
    repo: RepoArgs,
    from: &str,
    to: &str,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    let change = cache.has_file_changed_between(from, to, path)?;
    for rev in [from, to] {
        if !cache.contains_commit(rev)? {
            return Err(format!("unknown commit {}", rev).into());
        }
    }

    if change.is_changed() {
        println!("changed");
        Ok(())
    } else {
        println!("unchanged");
        std::process::exit(1);
    }
}

fn cmd_show(
    config: &Config,
    repo: RepoArgs,
    sha: &str,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    let content = cache
        .read_file_bytes(sha, path)?
        .ok_or_else(|| format!("{} does not exist at {}", path, sha))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

fn cmd_clean(config: &Config, repo: RepoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config, repo);
    cache.delete_cache()?;
    eprintln!("Removed {}", cache.mirror_path().display());
    Ok(())
}

fn cmd_doctor(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("repocache System Check\n");

    // Check git
    let git_version = std::process::Command::new(&config.git_binary)
        .args(["--version"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
    println!(
        "[{}] git: {}",
        if git_version.is_some() { "OK" } else { "FAIL" },
        git_version.as_deref().unwrap_or("not found")
    );

    // Check cache directory
    let paths = CachePaths::new(&config.cache_root);
    let cache_ok = paths.root().exists();
    println!(
        "[{}] Cache dir: {}",
        if cache_ok { "OK" } else { "INFO" },
        paths.root().display()
    );

    let lock_ok = std::fs::create_dir_all(paths.locks_dir()).is_ok();
    println!(
        "[{}] Lock dir: {}",
        if lock_ok { "OK" } else { "FAIL" },
        paths.locks_dir().display()
    );

    println!(
        "[INFO] Network timeout: {}",
        config
            .network_timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "none".into())
    );

    if git_version.is_none() || !lock_ok {
        std::process::exit(1);
    }

    Ok(())
}
