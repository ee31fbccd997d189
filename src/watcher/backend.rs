//! Watch backends: the OS notification capability behind a trait.
//!
//! [`NotifyBackend`] wraps notify's recommended watcher. [`ManualSource`]
//! is fed by hand and drives the dispatch loop in tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::events::{FileEvent, SourceEvent};
use crate::error::WatcherError;
use crate::Result;

/// Capacity of the notify event queue. A full queue blocks notify's
/// thread until the dispatch loop catches up.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Builds a fresh watch backend for every engine start.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn WatchBackend>> + Send + Sync>;

/// OS-level watch capability consumed by the path registry.
pub trait WatchBackend: Send {
    /// Add a path to the OS-level watch.
    ///
    /// # Errors
    ///
    /// Returns a registration error if the path cannot be watched.
    fn add(&mut self, path: &Path) -> Result<()>;

    /// Drop the OS-level watch for a path that is gone. Unknown paths are
    /// ignored.
    fn remove(&mut self, path: &Path);

    /// Stream of changes and errors produced by the backend.
    fn events(&self) -> Receiver<SourceEvent>;

    /// Release the OS watch handle.
    fn close(&mut self);
}

/// Backend built on notify's platform watcher.
pub struct NotifyBackend {
    watcher: Option<RecommendedWatcher>,
    /// Paths holding a kernel watch of their own.
    kernel_watches: HashSet<PathBuf>,
    watched_dirs: HashSet<PathBuf>,
    events_rx: Receiver<SourceEvent>,
}

impl NotifyBackend {
    /// Create a new notify-backed watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform watcher cannot be created.
    pub fn new() -> Result<Self> {
        let (tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for change in FileEvent::from_notify(&event) {
                        if tx.send(SourceEvent::Change(change)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(SourceEvent::Error(e.to_string()));
                }
            }
        })
        .map_err(|e| WatcherError::WatchSource(format!("failed to create watcher: {e}")))?;

        Ok(Self {
            watcher: Some(watcher),
            kernel_watches: HashSet::new(),
            watched_dirs: HashSet::new(),
            events_rx,
        })
    }

    /// Factory creating a new notify backend on each call.
    #[must_use]
    pub fn factory() -> BackendFactory {
        Arc::new(|| -> Result<Box<dyn WatchBackend>> { Ok(Box::new(Self::new()?)) })
    }
}

impl WatchBackend for NotifyBackend {
    fn add(&mut self, path: &Path) -> Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatcherError::registration(path, "watcher is closed").into());
        };

        let metadata =
            std::fs::metadata(path).map_err(|e| WatcherError::registration(path, e))?;

        // A directory watch already reports changes to its direct children.
        if !metadata.is_dir() && path.parent().is_some_and(|p| self.watched_dirs.contains(p)) {
            tracing::trace!(path = %path.display(), "Covered by directory watch");
            return Ok(());
        }

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::registration(path, e))?;

        self.kernel_watches.insert(path.to_path_buf());
        if metadata.is_dir() {
            self.watched_dirs.insert(path.to_path_buf());
        }

        Ok(())
    }

    fn remove(&mut self, path: &Path) {
        self.watched_dirs.remove(path);
        if !self.kernel_watches.remove(path) {
            return;
        }

        // The kernel usually dropped the watch already when the path went away.
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(path) {
                tracing::trace!(path = %path.display(), error = %e, "Watch already gone");
            }
        }
    }

    fn events(&self) -> Receiver<SourceEvent> {
        self.events_rx.clone()
    }

    fn close(&mut self) {
        if self.watcher.take().is_some() {
            self.kernel_watches.clear();
            self.watched_dirs.clear();
            tracing::debug!("Released OS watch handle");
        }
    }
}

impl Drop for NotifyBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hand-fed event source.
///
/// Clones share the same channel and bookkeeping, so a test can keep one
/// handle while the engine builds backends from another.
#[derive(Clone)]
pub struct ManualSource {
    tx: Arc<Mutex<Option<Sender<SourceEvent>>>>,
    rx: Receiver<SourceEvent>,
    added: Arc<Mutex<Vec<PathBuf>>>,
    removed: Arc<Mutex<Vec<PathBuf>>>,
    rejected: Arc<Mutex<HashSet<PathBuf>>>,
    closes: Arc<AtomicUsize>,
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSource {
    /// Create a new source with an open channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
            added: Arc::new(Mutex::new(Vec::new())),
            removed: Arc::new(Mutex::new(Vec::new())),
            rejected: Arc::new(Mutex::new(HashSet::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build a backend reading from this source.
    #[must_use]
    pub fn backend(&self) -> ManualBackend {
        ManualBackend {
            source: self.clone(),
            closed: false,
        }
    }

    /// Factory handing out backends that read from this source.
    #[must_use]
    pub fn factory(&self) -> BackendFactory {
        let source = self.clone();
        Arc::new(move || -> Result<Box<dyn WatchBackend>> { Ok(Box::new(source.backend())) })
    }

    /// Push an event. Returns `false` once the source is disconnected.
    pub fn send(&self, event: SourceEvent) -> bool {
        self.tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Push a filesystem change.
    pub fn push(&self, event: FileEvent) -> bool {
        self.send(SourceEvent::Change(event))
    }

    /// Close the event stream, as when the OS channel goes away.
    pub fn disconnect(&self) {
        self.tx.lock().take();
    }

    /// Make future `add` calls for `path` fail.
    pub fn reject(&self, path: impl Into<PathBuf>) {
        self.rejected.lock().insert(path.into());
    }

    /// Paths added at the OS level, in order.
    #[must_use]
    pub fn added(&self) -> Vec<PathBuf> {
        self.added.lock().clone()
    }

    /// Paths whose OS-level watch was dropped, in order.
    #[must_use]
    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().clone()
    }

    /// Number of times a backend built from this source was closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Backend produced by [`ManualSource::backend`].
pub struct ManualBackend {
    source: ManualSource,
    closed: bool,
}

impl WatchBackend for ManualBackend {
    fn add(&mut self, path: &Path) -> Result<()> {
        if self.closed {
            return Err(WatcherError::registration(path, "watcher is closed").into());
        }
        if self.source.rejected.lock().contains(path) {
            return Err(WatcherError::registration(path, "rejected").into());
        }
        self.source.added.lock().push(path.to_path_buf());
        Ok(())
    }

    fn remove(&mut self, path: &Path) {
        self.source.removed.lock().push(path.to_path_buf());
    }

    fn events(&self) -> Receiver<SourceEvent> {
        self.source.rx.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_notify_backend_rejects_missing_path() {
        let mut backend = NotifyBackend::new().unwrap();
        let err = backend.add(Path::new("/nonexistent/dirwatch/file")).unwrap_err();
        assert!(err.to_string().contains("failed to register"));
    }

    #[test]
    fn test_notify_backend_watches_dir_and_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();

        let mut backend = NotifyBackend::new().unwrap();
        backend.add(tmp.path()).unwrap();
        backend.add(&file).unwrap();
        assert!(backend.watched_dirs.contains(tmp.path()));

        backend.close();
        assert!(backend.add(&file).is_err());
    }

    #[test]
    fn test_notify_backend_rewatches_recreated_dir() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let mut backend = NotifyBackend::new().unwrap();
        backend.add(tmp.path()).unwrap();
        backend.add(&sub).unwrap();
        assert!(backend.kernel_watches.contains(&sub));

        std::fs::remove_dir(&sub).unwrap();
        backend.remove(&sub);
        assert!(!backend.watched_dirs.contains(&sub));
        assert!(!backend.kernel_watches.contains(&sub));

        std::fs::create_dir(&sub).unwrap();
        backend.add(&sub).unwrap();
        assert!(backend.watched_dirs.contains(&sub));
        assert!(backend.kernel_watches.contains(&sub));

        // Unknown paths are ignored.
        backend.remove(&tmp.path().join("never-watched"));
    }

    #[test]
    fn test_manual_source_round_trip() {
        let source = ManualSource::new();
        let mut backend = source.backend();
        let events = backend.events();

        backend.add(Path::new("/w/a.txt")).unwrap();
        assert_eq!(source.added(), vec![PathBuf::from("/w/a.txt")]);

        assert!(source.push(FileEvent::modified("/w/a.txt")));
        match events.try_recv().unwrap() {
            SourceEvent::Change(e) => assert_eq!(e.path, PathBuf::from("/w/a.txt")),
            SourceEvent::Error(e) => panic!("unexpected error {e}"),
        }

        source.reject("/w/b.txt");
        assert!(backend.add(Path::new("/w/b.txt")).is_err());

        backend.close();
        backend.close();
        assert_eq!(source.close_count(), 1);

        source.disconnect();
        assert!(!source.push(FileEvent::deleted("/w/a.txt")));
    }
}
