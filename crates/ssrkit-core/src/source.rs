//! Source server: serves module source by URL and reports file changes.
//!
//! [`FsSourceServer`] maps URL prefixes onto directories ("mounts") and
//! watches those directories with `notify`.

use crate::error::Error;
use futures::future::BoxFuture;
use notify::{
    event::{ModifyKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use parking_lot::Mutex;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the file change channel.
const CHANGE_CAPACITY: usize = 256;

/// Kind of file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Create,
    Modify,
    Remove,
}

/// A change to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Source is requested for server-side execution.
    pub ssr: bool,
}

#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Io(String),
}

/// The dev source server contract.
pub trait SourceServer: Send + Sync {
    /// Source for `url`, or [`SourceError::NotFound`].
    fn load_url<'a>(&'a self, url: &'a str, options: LoadOptions) -> BoxFuture<'a, Result<LoadedSource, SourceError>>;

    /// URL a file is served under, if any.
    fn url_for_file(&self, path: &Path) -> Option<String>;

    /// Every URL a file is served under.
    fn urls_for_file(&self, path: &Path) -> Vec<String> {
        self.url_for_file(path).into_iter().collect()
    }

    /// Stream of file changes.
    fn subscribe(&self) -> broadcast::Receiver<FileChange>;
}

/// A directory served under a URL prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub dir: PathBuf,
    /// URL prefix without trailing slash; empty for the root.
    pub url: String,
}

impl Mount {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, url: &str) -> Self {
        let trimmed = url.trim_matches('/');
        let url = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self {
            dir: normalize_path(&dir.into()),
            url,
        }
    }

    /// Path below the mount for `url`, if the URL falls under this mount.
    fn relative<'a>(&self, url: &'a str) -> Option<&'a str> {
        if self.url.is_empty() {
            return url.strip_prefix('/');
        }
        let rest = url.strip_prefix(self.url.as_str())?;
        if rest.is_empty() {
            return Some(rest);
        }
        rest.strip_prefix('/')
    }
}

/// File-system backed source server.
pub struct FsSourceServer {
    mounts: Vec<Mount>,
    changes: broadcast::Sender<FileChange>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsSourceServer {
    #[must_use]
    pub fn new(mut mounts: Vec<Mount>) -> Self {
        // Longest prefix wins.
        mounts.sort_by(|a, b| b.url.len().cmp(&a.url.len()));
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            mounts,
            changes,
            watcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// File backing `url`. Query strings and fragments are ignored; URLs with
    /// `..` segments never resolve.
    #[must_use]
    pub fn file_for_url(&self, url: &str) -> Option<PathBuf> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.split('/').any(|segment| segment == "..") {
            return None;
        }
        self.mounts.iter().find_map(|mount| {
            let rest = mount.relative(path)?;
            let mut file = mount.dir.clone();
            for segment in rest.split('/').filter(|s| !s.is_empty() && *s != ".") {
                file.push(segment);
            }
            Some(file)
        })
    }

    /// Start watching every mounted directory that exists.
    ///
    /// # Errors
    /// Returns an error if the watcher cannot be created or a directory
    /// cannot be watched.
    pub fn watch(&self) -> Result<(), Error> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let tx = self.changes.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for change in changes_from_event(&event) {
                        // No subscribers is fine.
                        let _ = tx.send(change);
                    }
                }
                Err(e) => error!(error = %e, "Watch error"),
            },
            Config::default(),
        )?;

        for mount in &self.mounts {
            if !mount.dir.is_dir() {
                warn!(dir = %mount.dir.display(), "Mounted directory does not exist; not watching");
                continue;
            }
            watcher.watch(&mount.dir, RecursiveMode::Recursive)?;
            info!(dir = %mount.dir.display(), url = %mount.url, "Watching directory");
        }

        *slot = Some(watcher);
        Ok(())
    }

    /// Stop watching.
    pub fn unwatch(&self) {
        if self.watcher.lock().take().is_some() {
            debug!("File watcher stopped");
        }
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Publish a change as if the watcher had seen it.
    pub fn notify_change(&self, path: impl Into<PathBuf>, kind: FileChangeKind) {
        let _ = self.changes.send(FileChange {
            path: path.into(),
            kind,
        });
    }
}

impl std::fmt::Debug for FsSourceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsSourceServer")
            .field("mounts", &self.mounts)
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl SourceServer for FsSourceServer {
    fn load_url<'a>(&'a self, url: &'a str, _options: LoadOptions) -> BoxFuture<'a, Result<LoadedSource, SourceError>> {
        Box::pin(async move {
            let file = self.file_for_url(url).ok_or(SourceError::NotFound)?;
            match tokio::fs::metadata(&file).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => return Err(SourceError::NotFound),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SourceError::NotFound),
                Err(e) => return Err(SourceError::Io(e.to_string())),
            }
            let contents = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => SourceError::NotFound,
                    _ => SourceError::Io(format!("{}: {e}", file.display())),
                })?;
            Ok(LoadedSource { contents })
        })
    }

    fn url_for_file(&self, path: &Path) -> Option<String> {
        self.urls_for_file(path).into_iter().next()
    }

    fn urls_for_file(&self, path: &Path) -> Vec<String> {
        let path = normalize_path(path);
        self.mounts
            .iter()
            .filter_map(|mount| {
                let relative = path.strip_prefix(&mount.dir).ok()?;
                let mut url = mount.url.clone();
                for component in relative.components() {
                    match component {
                        Component::Normal(part) => {
                            url.push('/');
                            url.push_str(&part.to_string_lossy());
                        }
                        _ => return None,
                    }
                }
                Some(url)
            })
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<FileChange> {
        self.changes.subscribe()
    }
}

fn changes_from_event(event: &Event) -> Vec<FileChange> {
    let change = |path: &PathBuf, kind| FileChange {
        path: path.clone(),
        kind,
    };
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| change(p, FileChangeKind::Create))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| change(p, FileChangeKind::Remove))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event
                .paths
                .iter()
                .map(|p| change(p, FileChangeKind::Remove))
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .map(|p| change(p, FileChangeKind::Create))
                .collect(),
            RenameMode::Both if event.paths.len() == 2 => vec![
                change(&event.paths[0], FileChangeKind::Remove),
                change(&event.paths[1], FileChangeKind::Create),
            ],
            _ => event
                .paths
                .iter()
                .map(|p| change(p, FileChangeKind::Modify))
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| change(p, FileChangeKind::Modify))
            .collect(),
        _ => Vec::new(),
    }
}

/// Canonicalize when possible. Removed files canonicalize through their parent.
fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = dunce::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => dunce::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange};
    use std::fs;
    use tempfile::tempdir;

    fn server(root: &Path) -> FsSourceServer {
        FsSourceServer::new(vec![
            Mount::new(root.join("src/routes"), "/_app/routes"),
            Mount::new(root.join("src"), "/_app/src/"),
        ])
    }

    #[tokio::test]
    async fn test_load_url_reads_mounted_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/routes")).unwrap();
        fs::write(dir.path().join("src/routes/index.mod"), "export const a = 1").unwrap();

        let server = server(dir.path());
        let source = server
            .load_url("/_app/routes/index.mod?import", LoadOptions { ssr: true })
            .await
            .unwrap();
        assert_eq!(source.contents, "export const a = 1");
    }

    #[tokio::test]
    async fn test_load_url_missing_is_not_found() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/routes")).unwrap();
        let server = server(dir.path());

        for url in ["/_app/routes/nope.mod", "/elsewhere/x.mod", "/_app/routes"] {
            let err = server.load_url(url, LoadOptions::default()).await.unwrap_err();
            assert_eq!(err, SourceError::NotFound, "{url}");
        }
    }

    #[test]
    fn test_dotdot_urls_are_rejected() {
        let dir = tempdir().unwrap();
        let server = server(dir.path());
        assert!(server.file_for_url("/_app/routes/../../secret").is_none());
    }

    #[test]
    fn test_urls_for_file_covers_overlapping_mounts() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/routes")).unwrap();
        fs::write(dir.path().join("src/routes/index.mod"), "").unwrap();
        let server = server(dir.path());

        let mut urls = server.urls_for_file(&dir.path().join("src/routes/index.mod"));
        urls.sort();
        assert_eq!(urls, vec!["/_app/routes/index.mod", "/_app/src/routes/index.mod"]);

        assert!(server.urls_for_file(Path::new("/definitely/not/mounted.mod")).is_empty());
    }

    #[test]
    fn test_removed_file_still_maps_to_url() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/routes")).unwrap();
        let server = server(dir.path());

        assert_eq!(
            server.url_for_file(&dir.path().join("src/routes/gone.mod")).as_deref(),
            Some("/_app/routes/gone.mod")
        );
    }

    #[test]
    fn test_rename_events_split_into_remove_and_create() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/a.mod"))
            .add_path(PathBuf::from("/b.mod"));
        let changes = changes_from_event(&event);
        assert_eq!(changes[0].kind, FileChangeKind::Remove);
        assert_eq!(changes[1].kind, FileChangeKind::Create);

        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/c.mod"));
        assert_eq!(changes_from_event(&event)[0].kind, FileChangeKind::Create);

        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/c.mod"));
        assert_eq!(changes_from_event(&event)[0].kind, FileChangeKind::Modify);
    }

    #[tokio::test]
    async fn test_notify_change_reaches_subscribers() {
        let dir = tempdir().unwrap();
        let server = server(dir.path());
        let mut rx = server.subscribe();

        server.notify_change("/x.mod", FileChangeKind::Modify);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.path, PathBuf::from("/x.mod"));
        assert_eq!(change.kind, FileChangeKind::Modify);
    }
}
