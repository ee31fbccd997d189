//! Registry of watched paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;

use super::backend::WatchBackend;
use super::events::SourceEvent;
use crate::Result;

/// A path under observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub path: PathBuf,
    /// Directories are watched but never content-scanned.
    pub is_directory: bool,
}

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The path is new and now watched.
    Added,
    /// The path was already registered; nothing changed.
    AlreadyWatched,
}

/// Set of watched paths plus the backend that watches them.
pub struct PathRegistry {
    backend: Box<dyn WatchBackend>,
    targets: HashMap<PathBuf, WatchTarget>,
}

impl PathRegistry {
    /// Create an empty registry over a backend.
    #[must_use]
    pub fn new(backend: Box<dyn WatchBackend>) -> Self {
        Self {
            backend,
            targets: HashMap::new(),
        }
    }

    /// Register a path with the registry and the OS-level watch.
    ///
    /// Registering a known path is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a registration error if the backend cannot watch the path;
    /// the path is then left unregistered.
    pub fn register(&mut self, path: &Path, is_directory: bool) -> Result<Registration> {
        if self.targets.contains_key(path) {
            tracing::debug!(path = %path.display(), "Path already watched");
            return Ok(Registration::AlreadyWatched);
        }

        self.backend.add(path)?;
        self.targets.insert(
            path.to_path_buf(),
            WatchTarget {
                path: path.to_path_buf(),
                is_directory,
            },
        );

        tracing::info!(path = %path.display(), is_directory, "Watching path");
        Ok(Registration::Added)
    }

    /// Drop a path that the OS layer reported gone, along with anything
    /// registered beneath it, so a later registration watches it afresh.
    ///
    /// Returns the target for `path` itself, if it was registered.
    pub fn forget(&mut self, path: &Path) -> Option<WatchTarget> {
        let removed = self.targets.remove(path);

        if removed.as_ref().is_some_and(|t| t.is_directory) {
            let nested: Vec<PathBuf> = self
                .targets
                .keys()
                .filter(|p| p.starts_with(path))
                .cloned()
                .collect();
            for child in nested {
                self.targets.remove(&child);
                self.backend.remove(&child);
            }
        }

        if removed.is_some() {
            self.backend.remove(path);
            tracing::info!(path = %path.display(), "Stopped watching path");
        }
        removed
    }

    /// Whether a path is registered.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.targets.contains_key(path)
    }

    /// Look up a registered path.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&WatchTarget> {
        self.targets.get(path)
    }

    /// Number of registered paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Registered targets sorted by path.
    #[must_use]
    pub fn targets(&self) -> Vec<WatchTarget> {
        let mut targets: Vec<_> = self.targets.values().cloned().collect();
        targets.sort_by(|a, b| a.path.cmp(&b.path));
        targets
    }

    /// Event stream of the underlying backend.
    #[must_use]
    pub fn events(&self) -> Receiver<SourceEvent> {
        self.backend.events()
    }

    /// Release the OS watch handle.
    pub fn release(&mut self) {
        self.backend.close();
    }
}

impl std::fmt::Debug for PathRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRegistry")
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}
