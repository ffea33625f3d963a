//! Advisory per-mirror locking.

use std::fs::{File, OpenOptions};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::CachePaths;
use crate::types::CacheKey;

const FIRST_RETRY: Duration = Duration::from_millis(10);
const MAX_RETRY: Duration = Duration::from_millis(500);

/// Exclusive flock on `{root}/.locks/{key}.lock`, released when dropped.
///
/// Serializes mirror clones, fetches and removal for one key, across threads
/// and processes alike.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Lock the mirror of `key`, retrying with backoff for up to `timeout`.
    ///
    /// Fails with `ErrorKind::TimedOut` when another holder keeps the lock.
    pub fn acquire(paths: &CachePaths, key: &CacheKey, timeout: Duration) -> io::Result<Self> {
        std::fs::create_dir_all(paths.locks_dir())?;
        let lock_path = paths.lock_path(key);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        let mut retry = FIRST_RETRY;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    log::debug!("locked mirror {}", key);
                    return Ok(Self { file });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("mirror {} still locked after {:?}", key, timeout),
                        ));
                    }
                    thread::sleep(retry);
                    retry = (retry * 2).min(MAX_RETRY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
