//! The event dispatch loop.
//!
//! A single consumer applies every filesystem event, and every synthetic
//! command, to the aggregator one at a time. Nothing else writes runs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, TryRecvError};

use super::aggregator::Aggregator;
use super::events::{EventKind, FileEvent, SourceEvent};
use super::registry::{PathRegistry, Registration};
use super::scanner::{scan_file, DiscoveredPath, ScanOutcome};
use crate::config::SharedSettings;
use crate::server::metrics::{
    EVENTS_TOTAL, READ_ERRORS_TOTAL, REGISTRATION_ERRORS_TOTAL, WATCHED_PATHS,
};
use crate::server::observability::spans;

/// How many pruned directories are remembered for duplicate removals.
const PRUNED_DIRS_CAPACITY: usize = 64;

/// Synthetic work injected into the loop alongside OS events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Found by the startup walk: register, then scan if it is a file.
    Discovered(DiscoveredPath),
    /// Manual rescan of a file.
    Rescan(PathBuf),
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Stop was requested, or the owner went away.
    Cancelled,
    /// The backend's event stream disconnected.
    SourceClosed,
}

/// Counters for the dispatch loop.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub events: AtomicU64,
    pub scans: AtomicU64,
    pub read_errors: AtomicU64,
    pub registration_errors: AtomicU64,
    pub persistence_errors: AtomicU64,
    pub source_errors: AtomicU64,
    pub watched_paths: AtomicU64,
}

impl DispatchStats {
    /// Create new stats tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get snapshot of current stats.
    #[must_use]
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            registration_errors: self.registration_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            watched_paths: self.watched_paths.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStatsSnapshot {
    pub events: u64,
    pub scans: u64,
    pub read_errors: u64,
    pub registration_errors: u64,
    pub persistence_errors: u64,
    pub source_errors: u64,
    pub watched_paths: u64,
}

/// Routes events to the registry, scanner and aggregator.
pub struct Dispatcher {
    registry: PathRegistry,
    aggregator: Aggregator,
    settings: SharedSettings,
    root: PathBuf,
    stats: Arc<DispatchStats>,
    /// A directory with its own watch is reported removed twice: once by
    /// its parent and once by itself.
    pruned_dirs: VecDeque<PathBuf>,
}

impl Dispatcher {
    /// Create a dispatcher for the tree rooted at `root`.
    ///
    /// Recorded paths are stored relative to `root`.
    #[must_use]
    pub fn new(
        registry: PathRegistry,
        aggregator: Aggregator,
        settings: SharedSettings,
        root: impl Into<PathBuf>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            registry,
            aggregator,
            settings,
            root: root.into(),
            stats,
            pruned_dirs: VecDeque::with_capacity(PRUNED_DIRS_CAPACITY),
        }
    }

    /// Path registry.
    #[must_use]
    pub const fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Run until cancelled or the event source closes, then release the
    /// OS watch handle.
    ///
    /// Cancellation is checked before every message; a message already
    /// being handled runs to completion.
    pub fn run(mut self, commands: &Receiver<Command>, cancel: &Receiver<()>) -> LoopExit {
        let _span = spans::dispatch_span(&self.root).entered();
        let events = self.registry.events();
        tracing::info!("Dispatch loop started");

        let exit = loop {
            match cancel.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break LoopExit::Cancelled,
                Err(TryRecvError::Empty) => {}
            }

            select! {
                recv(cancel) -> _ => break LoopExit::Cancelled,
                recv(events) -> msg => match msg {
                    Ok(SourceEvent::Change(event)) => self.handle_event(&event),
                    Ok(SourceEvent::Error(reason)) => {
                        self.stats.source_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%reason, "Watch source error");
                    }
                    Err(_) => break LoopExit::SourceClosed,
                },
                recv(commands) -> msg => match msg {
                    Ok(command) => self.handle_command(command),
                    Err(_) => break LoopExit::Cancelled,
                },
            }
        };

        self.registry.release();
        tracing::info!(?exit, "Dispatch loop stopped");
        exit
    }

    /// Apply a single filesystem event.
    pub fn handle_event(&mut self, event: &FileEvent) {
        self.refresh_settings();
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        EVENTS_TOTAL.with_label_values(&[event.kind.as_str()]).inc();

        tracing::debug!(
            kind = event.kind.as_str(),
            path = %event.path.display(),
            observed_at = %event.observed_at,
            "Handling event"
        );

        let display = self.display_path(&event.path);
        match event.kind {
            EventKind::Modified => self.scan_and_record(&event.path),
            EventKind::Created => {
                self.pruned_dirs.retain(|p| p != &event.path);
                self.register(&event.path, event.path.is_dir());
                if let Err(e) = self.aggregator.record_addition(&display) {
                    self.persistence_failed(&e);
                }
                self.scan_and_record(&event.path);
            }
            EventKind::Deleted => {
                if self.forget(&event.path) {
                    tracing::debug!(path = %event.path.display(), "Duplicate removal ignored");
                } else if let Err(e) = self.aggregator.record_deletion(&display) {
                    self.persistence_failed(&e);
                }
            }
        }
    }

    /// Apply a synthetic command.
    pub fn handle_command(&mut self, command: Command) {
        self.refresh_settings();
        match command {
            Command::Discovered(found) => {
                self.register(&found.path, found.is_directory);
                if !found.is_directory {
                    self.scan_and_record(&found.path);
                }
            }
            Command::Rescan(path) => self.scan_and_record(&path),
        }
    }

    fn refresh_settings(&mut self) {
        let settings = self.settings.read().clone();
        self.aggregator.reconfigure(&settings);
    }

    fn register(&mut self, path: &Path, is_directory: bool) {
        match self.registry.register(path, is_directory) {
            Ok(Registration::Added) => self.publish_watched_count(),
            Ok(Registration::AlreadyWatched) => {}
            Err(e) => {
                self.stats.registration_errors.fetch_add(1, Ordering::Relaxed);
                REGISTRATION_ERRORS_TOTAL.inc();
                tracing::warn!(path = %path.display(), error = %e, "Skipping path");
            }
        }
    }

    /// Prune a path the OS reported gone. Returns `true` when the removal
    /// was already applied for a directory pruned moments ago.
    fn forget(&mut self, path: &Path) -> bool {
        if let Some(target) = self.registry.forget(path) {
            self.publish_watched_count();
            if target.is_directory {
                if self.pruned_dirs.len() == PRUNED_DIRS_CAPACITY {
                    self.pruned_dirs.pop_front();
                }
                self.pruned_dirs.push_back(target.path);
            }
            return false;
        }

        match self.pruned_dirs.iter().position(|p| p == path) {
            Some(index) => {
                self.pruned_dirs.remove(index);
                true
            }
            None => false,
        }
    }

    fn publish_watched_count(&self) {
        let count = self.registry.len() as u64;
        self.stats.watched_paths.store(count, Ordering::Relaxed);
        WATCHED_PATHS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    fn scan_and_record(&mut self, path: &Path) {
        let marker = self.settings.read().marker.clone();

        match scan_file(path, &marker) {
            Ok(ScanOutcome::Hits(hits)) => {
                let display = self.display_path(path);
                if let Err(e) = self.aggregator.record_scan(&display, hits) {
                    self.persistence_failed(&e);
                }
                self.stats.scans.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ScanOutcome::Directory) => {}
            Err(e) => {
                self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                READ_ERRORS_TOTAL.inc();
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
            }
        }
    }

    fn persistence_failed(&self, error: &crate::Error) {
        self.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(error = %error, "Persistence failure");
    }

    /// Path as recorded in runs: relative to the root when under it.
    fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.display().to_string(),
            _ => path.display().to_string(),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.root)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
