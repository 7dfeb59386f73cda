//! Memoized module loads and the store that pairs them with the graph.
//!
//! The cache holds shared futures, not finished modules, so a second request
//! for a URL that is still loading joins the first load instead of starting
//! another one.

use super::error::LoadError;
use super::graph::DependencyGraph;
use super::loader::LoadedModule;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type LoadResult = Result<Arc<LoadedModule>, LoadError>;

/// A load that may still be in flight. Cloning joins it.
pub type PendingLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Identity of one cache entry, used to evict only the entry a failure
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

struct Entry {
    id: EntryId,
    load: PendingLoad,
}

/// URL → in-flight or completed load.
#[derive(Default)]
pub struct ModuleCache {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

impl ModuleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `url`, creating it with `make` if absent.
    pub fn get_or_create<F>(&mut self, url: &str, make: F) -> PendingLoad
    where
        F: FnOnce(EntryId) -> BoxFuture<'static, LoadResult>,
    {
        if let Some(entry) = self.entries.get(url) {
            return entry.load.clone();
        }
        let id = EntryId(self.next_id);
        self.next_id += 1;
        let load = make(id).shared();
        self.entries.insert(
            url.to_string(),
            Entry {
                id,
                load: load.clone(),
            },
        );
        load
    }

    pub fn remove(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// Remove the entry for `url` only if it is still entry `id`.
    pub fn remove_entry(&mut self, url: &str, id: EntryId) -> bool {
        if self.entries.get(url).is_some_and(|e| e.id == id) {
            self.entries.remove(url);
            return true;
        }
        false
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Cached URLs, sorted.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.entries.keys().cloned().collect();
        urls.sort();
        urls
    }
}

/// Cache and graph, always locked together.
#[derive(Default)]
pub struct ModuleStore {
    pub cache: ModuleCache,
    pub graph: DependencyGraph,
}

impl ModuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `url` and everything that transitively imports it.
    ///
    /// Returns the URLs whose cache entries were removed. A URL's graph entry
    /// is taken before its importers are queued, so every URL is expanded at
    /// most once and cycles terminate.
    pub fn invalidate(&mut self, url: &str) -> Vec<String> {
        let mut dropped = Vec::new();
        let mut queue = vec![url.to_string()];

        while let Some(current) = queue.pop() {
            if self.cache.remove(&current) {
                dropped.push(current.clone());
            }
            if let Some(importers) = self.graph.take_importers(&current) {
                let mut importers: Vec<String> = importers.into_iter().collect();
                importers.sort();
                queue.extend(importers.into_iter().rev());
            }
        }

        if !dropped.is_empty() {
            debug!(url, count = dropped.len(), "Invalidated modules");
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.graph.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future;

    fn ready(url: &str) -> BoxFuture<'static, LoadResult> {
        Box::pin(future::ready(Ok(Arc::new(LoadedModule::placeholder(url)))))
    }

    #[test]
    fn test_get_or_create_reuses_entry() {
        let mut cache = ModuleCache::new();
        let mut calls = 0;
        let _ = cache.get_or_create("/a.mod", |_| {
            calls += 1;
            ready("/a.mod")
        });
        let _ = cache.get_or_create("/a.mod", |_| {
            calls += 1;
            ready("/a.mod")
        });
        assert_eq!(calls, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_entry_ignores_stale_id() {
        let mut cache = ModuleCache::new();
        let mut first = None;
        let _ = cache.get_or_create("/a.mod", |id| {
            first = Some(id);
            ready("/a.mod")
        });
        let first = first.unwrap();
        cache.remove("/a.mod");
        let _ = cache.get_or_create("/a.mod", |_| ready("/a.mod"));

        assert!(!cache.remove_entry("/a.mod", first));
        assert!(cache.contains("/a.mod"));
    }

    #[test]
    fn test_invalidate_walks_importers() {
        let mut store = ModuleStore::new();
        for url in ["/a.mod", "/b.mod", "/c.mod", "/d.mod"] {
            let _ = store.cache.get_or_create(url, |_| ready(url));
        }
        // c -> b -> a, d unrelated
        store.graph.record_edge("/b.mod", "/a.mod");
        store.graph.record_edge("/c.mod", "/b.mod");

        let dropped = store.invalidate("/a.mod");
        assert_eq!(dropped, vec!["/a.mod", "/b.mod", "/c.mod"]);
        assert_eq!(store.cache.urls(), vec!["/d.mod"]);
        assert!(store.graph.is_empty());

        assert!(store.invalidate("/a.mod").is_empty());
        assert_eq!(store.cache.urls(), vec!["/d.mod"]);
    }

    #[test]
    fn test_invalidate_terminates_on_cycles() {
        let mut store = ModuleStore::new();
        for url in ["/a.mod", "/b.mod"] {
            let _ = store.cache.get_or_create(url, |_| ready(url));
        }
        store.graph.record_edge("/a.mod", "/b.mod");
        store.graph.record_edge("/b.mod", "/a.mod");

        let mut dropped = store.invalidate("/a.mod");
        dropped.sort();
        assert_eq!(dropped, vec!["/a.mod", "/b.mod"]);
        assert!(store.cache.is_empty());
    }

    #[test]
    fn test_invalidate_unknown_url_only_touches_cache() {
        let mut store = ModuleStore::new();
        let _ = store.cache.get_or_create("/x.mod", |_| ready("/x.mod"));
        assert_eq!(store.invalidate("/x.mod"), vec!["/x.mod"]);
        assert!(store.invalidate("/nope.mod").is_empty());
    }
}
