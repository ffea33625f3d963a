//! Shared repository handles, one per cache key.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::RepoCache;
use crate::config::Config;
use crate::exec::{Executor, LogSink, OutputSink};
use crate::types::CacheKey;

/// Hands out one [`RepoCache`] per cache key.
///
/// Callers asking for the same key get the same handle, so they share its
/// sync timestamp as well as its lock.
pub struct RepoRegistry {
    config: Config,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn OutputSink>,
    handles: DashMap<CacheKey, Arc<RepoCache>>,
}

impl RepoRegistry {
    /// Handles stream their progress to the `log` facade until
    /// [`RepoRegistry::with_sink`] says otherwise.
    pub fn new(config: Config, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            executor,
            sink: Arc::new(LogSink),
            handles: DashMap::new(),
        }
    }

    /// Sink given to every handle created from now on.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get or create the handle for `key`.
    ///
    /// If `key` is already registered under another URL, the handle is
    /// replaced. The mirror on disk stays and keeps fetching from its own origin.
    pub fn handle(&self, url: &str, key: CacheKey) -> Arc<RepoCache> {
        match self.handles.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().url() == url {
                    return Arc::clone(entry.get());
                }
                log::warn!(
                    "cache key {} re-registered with url {} (was {})",
                    entry.key(),
                    url,
                    entry.get().url()
                );
                let handle = self.create(url, entry.key().clone());
                entry.insert(Arc::clone(&handle));
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.create(url, entry.key().clone());
                entry.insert(Arc::clone(&handle));
                handle
            }
        }
    }

    /// Registered handle for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<RepoCache>> {
        self.handles.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Forget the handle for `key`. The mirror on disk is untouched.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<RepoCache>> {
        self.handles.remove(key).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn create(&self, url: &str, key: CacheKey) -> Arc<RepoCache> {
        log::debug!("registering {} for {}", key, url);
        Arc::new(
            RepoCache::new(url, key, &self.config, Arc::clone(&self.executor))
                .with_sink(Arc::clone(&self.sink)),
        )
    }
}
