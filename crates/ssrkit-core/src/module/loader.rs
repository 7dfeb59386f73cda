//! The incremental SSR module loader.
//!
//! Fetches transformed source from a [`SourceServer`], runs it through the
//! [`Transform`] and [`Executor`] stages and caches the result by URL.
//! Path imports are recorded in a reverse dependency graph so that a change
//! to one file drops every module that transitively imported it.

use super::cache::{LoadResult, ModuleStore};
use super::environment::ModuleEnvironment;
use super::error::LoadError;
use super::executor::{Executor, ModExecutor};
use super::exports::ModuleExports;
use super::package::{PackageRegistry, PackageResolver};
use super::transform::{ModTransform, Transform};
use crate::render::LoadModule;
use crate::source::{LoadOptions, SourceError, SourceServer};
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the invalidation event channel.
const EVENT_CAPACITY: usize = 64;

/// A successfully loaded module.
#[derive(Debug)]
pub struct LoadedModule {
    pub url: String,
    pub exports: ModuleExports,
    /// Stylesheet URLs of this module and everything it imports, in first-seen
    /// order without duplicates.
    pub stylesheets: Vec<String>,
}

impl LoadedModule {
    /// Module with no exports and no stylesheets.
    #[must_use]
    pub fn placeholder(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exports: ModuleExports::new(),
            stylesheets: Vec::new(),
        }
    }
}

/// Result of resolving one import.
#[derive(Debug, Clone)]
pub enum Imported {
    Module(Arc<LoadedModule>),
    /// Plain export object from the package resolver.
    Package(ModuleExports),
}

impl Imported {
    #[must_use]
    pub fn exports(&self) -> ModuleExports {
        match self {
            Self::Module(module) => module.exports.clone(),
            Self::Package(exports) => exports.clone(),
        }
    }

    /// Packages carry no stylesheets.
    #[must_use]
    pub fn stylesheets(&self) -> &[String] {
        match self {
            Self::Module(module) => &module.stylesheets,
            Self::Package(_) => &[],
        }
    }
}

/// Broadcast after modules were dropped from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// File whose change caused the invalidation, if any.
    pub file: Option<PathBuf>,
    pub urls: Vec<String>,
}

struct LoaderInner {
    server: Arc<dyn SourceServer>,
    transform: Arc<dyn Transform>,
    executor: Arc<dyn Executor>,
    packages: Arc<dyn PackageResolver>,
    store: Mutex<ModuleStore>,
    events: broadcast::Sender<Invalidation>,
}

/// Builder for [`IncrementalLoader`].
pub struct LoaderBuilder {
    server: Arc<dyn SourceServer>,
    transform: Arc<dyn Transform>,
    executor: Arc<dyn Executor>,
    packages: Arc<dyn PackageResolver>,
}

impl LoaderBuilder {
    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_packages(mut self, packages: Arc<dyn PackageResolver>) -> Self {
        self.packages = packages;
        self
    }

    #[must_use]
    pub fn build(self) -> IncrementalLoader {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        IncrementalLoader {
            inner: Arc::new(LoaderInner {
                server: self.server,
                transform: self.transform,
                executor: self.executor,
                packages: self.packages,
                store: Mutex::new(ModuleStore::new()),
                events,
            }),
            task: Mutex::new(None),
        }
    }
}

/// Loads modules on demand and keeps them until a dependency changes.
pub struct IncrementalLoader {
    inner: Arc<LoaderInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IncrementalLoader {
    /// Loader with the built-in `.mod` transform and executor and no packages.
    #[must_use]
    pub fn new(server: Arc<dyn SourceServer>) -> Self {
        Self::builder(server).build()
    }

    #[must_use]
    pub fn builder(server: Arc<dyn SourceServer>) -> LoaderBuilder {
        LoaderBuilder {
            server,
            transform: Arc::new(ModTransform),
            executor: Arc::new(ModExecutor),
            packages: Arc::new(PackageRegistry::new()),
        }
    }

    /// Load the module at `url`, reusing a cached or in-flight load.
    pub async fn load(&self, url: &str) -> LoadResult {
        self.inner.load(url.to_string(), Vec::new()).await
    }

    /// Drop `url` and its transitive importers from the cache.
    pub fn invalidate(&self, url: &str) -> Vec<String> {
        self.inner.invalidate_urls(&[url.to_string()], None)
    }

    /// Drop every module served from `path` and their transitive importers.
    pub fn invalidate_file(&self, path: &Path) -> Vec<String> {
        self.inner.invalidate_file(path)
    }

    /// Start following the source server's change notifications.
    ///
    /// Must be called from within a tokio runtime. Calling it again while the
    /// task is running has no effect.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let mut changes = self.inner.server.subscribe();
        let weak = Arc::downgrade(&self.inner);

        *task = Some(tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(inner) = weak.upgrade() else { break };
                match received {
                    Ok(change) => {
                        debug!(path = %change.path.display(), kind = ?change.kind, "Source changed");
                        inner.invalidate_file(&change.path);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed file change notifications; dropping all modules");
                        inner.invalidate_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        debug!("Module invalidation started");
    }

    /// Stop following changes and drop every cached module.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.store.lock().clear();
        debug!("Module loader shut down");
    }

    /// Receive an event after every non-empty invalidation.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_cached(&self, url: &str) -> bool {
        self.inner.store.lock().cache.contains(url)
    }

    /// URLs known to import `url`.
    #[must_use]
    pub fn importers_of(&self, url: &str) -> Vec<String> {
        self.inner.store.lock().graph.importers_of(url)
    }

    #[must_use]
    pub fn cached_urls(&self) -> Vec<String> {
        self.inner.store.lock().cache.urls()
    }
}

impl Drop for IncrementalLoader {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for IncrementalLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalLoader")
            .field("cached", &self.cached_urls())
            .finish_non_exhaustive()
    }
}

impl LoadModule for IncrementalLoader {
    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, LoadResult> {
        self.inner.load(url.to_string(), Vec::new())
    }
}

impl LoaderInner {
    fn load(self: &Arc<Self>, url: String, stack: Vec<String>) -> BoxFuture<'static, LoadResult> {
        if stack.contains(&url) {
            let mut chain = stack;
            chain.push(url.clone());
            warn!(chain = %chain.join(" -> "), "Circular dependency");
            return Box::pin(future::ready(Ok(Arc::new(LoadedModule::placeholder(url)))));
        }

        let weak = Arc::downgrade(self);
        let pending = self.store.lock().cache.get_or_create(&url, |id| {
            let url = url.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(LoadError::Cancelled { url });
                };
                let result = inner.fetch_and_initialize(&url, stack).await;
                if let Err(err) = &result {
                    debug!(url = %url, error = %err, "Module failed to load");
                    inner.store.lock().cache.remove_entry(&url, id);
                }
                result
            })
        });
        Box::pin(pending)
    }

    async fn fetch_and_initialize(self: &Arc<Self>, url: &str, stack: Vec<String>) -> LoadResult {
        debug!(url, "Loading module");

        let source = self
            .server
            .load_url(url, LoadOptions { ssr: true })
            .await
            .map_err(|err| match err {
                SourceError::NotFound => LoadError::NotFound {
                    url: url.to_string(),
                },
                SourceError::Io(message) => LoadError::Fetch {
                    url: url.to_string(),
                    message,
                },
            })?;

        let output = self
            .transform
            .transform(&source.contents)
            .map_err(|err| LoadError::Transform {
                url: url.to_string(),
                line: err.line,
                message: err.message,
            })?;

        let mut chain = stack;
        chain.push(url.to_string());

        let mut stylesheets = Vec::new();
        for css in &output.css {
            push_unique(&mut stylesheets, resolve_specifier(url, css));
        }

        let imported = if output.deps.is_empty() {
            Vec::new()
        } else {
            future::try_join_all(
                output
                    .deps
                    .iter()
                    .map(|dep| self.import(url, &dep.source, &chain)),
            )
            .await?
        };

        let exports = ModuleExports::new();
        let importer = Importer {
            loader: Arc::downgrade(self),
            url: url.to_string(),
            stack: chain.clone(),
        };
        let mut env =
            ModuleEnvironment::new(url, output.names, exports.clone()).with_importer(importer);
        for (dep, imported) in output.deps.iter().zip(&imported) {
            env.insert_binding(dep.name.clone(), imported.exports());
            for css in imported.stylesheets() {
                push_unique(&mut stylesheets, css.clone());
            }
        }

        self.executor
            .execute(&output.code, &mut env)
            .map_err(|err| LoadError::Execution {
                url: url.to_string(),
                message: err.message,
                stack: chain.iter().rev().cloned().collect(),
            })?;

        Ok(Arc::new(LoadedModule {
            url: url.to_string(),
            exports,
            stylesheets,
        }))
    }

    fn import(
        self: &Arc<Self>,
        importer: &str,
        specifier: &str,
        stack: &[String],
    ) -> BoxFuture<'static, Result<Imported, LoadError>> {
        if is_path_specifier(specifier) {
            let resolved = resolve_specifier(importer, specifier);
            self.store.lock().graph.record_edge(importer, &resolved);
            let load = self.load(resolved, stack.to_vec());
            return Box::pin(async move { load.await.map(Imported::Module) });
        }

        let inner = Arc::clone(self);
        let specifier = specifier.to_string();
        let importer = importer.to_string();
        Box::pin(async move {
            match inner.packages.resolve(&specifier, &importer).await {
                Some(exports) => Ok(Imported::Package(exports)),
                None => Err(LoadError::Package {
                    specifier,
                    importer,
                }),
            }
        })
    }

    fn invalidate_file(&self, path: &Path) -> Vec<String> {
        let urls = self.server.urls_for_file(path);
        if urls.is_empty() {
            return Vec::new();
        }
        self.invalidate_urls(&urls, Some(path.to_path_buf()))
    }

    fn invalidate_urls(&self, urls: &[String], file: Option<PathBuf>) -> Vec<String> {
        let dropped: Vec<String> = {
            let mut store = self.store.lock();
            urls.iter().flat_map(|url| store.invalidate(url)).collect()
        };
        if !dropped.is_empty() {
            info!(count = dropped.len(), "Invalidated modules");
            // No receivers is fine.
            let _ = self.events.send(Invalidation {
                file,
                urls: dropped.clone(),
            });
        }
        dropped
    }

    fn invalidate_all(&self) {
        let urls = {
            let mut store = self.store.lock();
            let urls = store.cache.urls();
            store.clear();
            urls
        };
        if !urls.is_empty() {
            let _ = self.events.send(Invalidation { file: None, urls });
        }
    }
}

/// Handle for dynamic imports relative to a module.
#[derive(Clone)]
pub struct Importer {
    loader: Weak<LoaderInner>,
    url: String,
    stack: Vec<String>,
}

impl Importer {
    /// URL imports are resolved against.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Import `specifier` the way a static import would, recording the edge.
    pub fn import(&self, specifier: &str) -> BoxFuture<'static, Result<ModuleExports, LoadError>> {
        let Some(inner) = self.loader.upgrade() else {
            return Box::pin(future::ready(Err(LoadError::Cancelled {
                url: self.url.clone(),
            })));
        };
        let pending = inner.import(&self.url, specifier, &self.stack);
        Box::pin(async move { pending.await.map(|imported| imported.exports()) })
    }
}

impl fmt::Debug for Importer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Importer").field("url", &self.url).finish()
    }
}

fn is_path_specifier(specifier: &str) -> bool {
    specifier.starts_with('/') || specifier.starts_with('.')
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Resolve `specifier` against the URL of the importing module.
///
/// `.` and `..` segments are collapsed; `..` never climbs above the root.
/// A query string or fragment on the specifier is kept.
#[must_use]
pub fn resolve_specifier(base: &str, specifier: &str) -> String {
    let joined = if specifier.starts_with('/') {
        specifier.to_string()
    } else {
        let base = base.split(['?', '#']).next().unwrap_or(base);
        let dir = base.rfind('/').map_or("/", |i| &base[..=i]);
        format!("{dir}{specifier}")
    };

    let (path, suffix) = match joined.find(['?', '#']) {
        Some(i) => joined.split_at(i),
        None => (joined.as_str(), ""),
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut resolved = String::with_capacity(joined.len());
    for segment in segments {
        resolved.push('/');
        resolved.push_str(segment);
    }
    if resolved.is_empty() {
        resolved.push('/');
    }
    resolved.push_str(suffix);
    resolved
}
