//! Lifecycle control for the dispatch loop.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;

use super::aggregator::Aggregator;
use super::backend::{BackendFactory, NotifyBackend};
use super::dispatch::{Command, DispatchStats, DispatchStatsSnapshot, Dispatcher, LoopExit};
use super::registry::PathRegistry;
use super::scanner::walk_directory;
use crate::config::{SharedSettings, WatchSettings};
use crate::error::WatcherError;
use crate::server::metrics::WATCHED_PATHS;
use crate::storage::{Database, TaskRun};
use crate::{Error, Result};

struct RunningLoop {
    root: PathBuf,
    commands: Sender<Command>,
    cancel: Sender<()>,
    handle: JoinHandle<LoopExit>,
}

impl RunningLoop {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn shutdown(self) -> Option<LoopExit> {
        let _ = self.cancel.try_send(());
        drop(self.commands);
        match self.handle.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                tracing::error!("Dispatch thread panicked");
                None
            }
        }
    }
}

/// Starts and stops the watch-and-aggregate loop.
pub struct Engine {
    db: Database,
    settings: SharedSettings,
    backend_factory: BackendFactory,
    stats: Arc<DispatchStats>,
    running: Mutex<Option<RunningLoop>>,
}

impl Engine {
    /// Create an engine that watches through the OS notification backend.
    #[must_use]
    pub fn new(db: Database, settings: SharedSettings) -> Self {
        Self::with_backend(db, settings, NotifyBackend::factory())
    }

    /// Create an engine over a custom backend.
    #[must_use]
    pub fn with_backend(
        db: Database,
        settings: SharedSettings,
        backend_factory: BackendFactory,
    ) -> Self {
        Self {
            db,
            settings,
            backend_factory,
            stats: DispatchStats::new(),
            running: Mutex::new(None),
        }
    }

    /// Start watching the configured directory.
    ///
    /// Returns `false` when already running. A loop that ended on its own
    /// is reaped and started afresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, the directory cannot
    /// be resolved, or the backend or thread cannot be created.
    pub fn start(&self) -> Result<bool> {
        let mut running = self.running.lock();

        if let Some(active) = running.as_ref() {
            if active.is_alive() {
                return Ok(false);
            }
        }
        if let Some(finished) = running.take() {
            let exit = finished.shutdown();
            tracing::info!(?exit, "Reaped finished dispatch loop");
        }

        let settings = self.settings.read().clone();
        settings.validate()?;

        let root = settings
            .directory
            .canonicalize()
            .map_err(|e| WatcherError::registration(&settings.directory, e))?;
        if !root.is_dir() {
            return Err(WatcherError::registration(&root, "not a directory").into());
        }

        let backend = (self.backend_factory)()?;
        let registry = PathRegistry::new(backend);
        let aggregator = Aggregator::new(self.db.clone(), &settings);
        self.stats.watched_paths.store(0, Ordering::Relaxed);
        WATCHED_PATHS.set(0);

        let dispatcher = Dispatcher::new(
            registry,
            aggregator,
            Arc::clone(&self.settings),
            root.clone(),
            Arc::clone(&self.stats),
        );

        let (commands_tx, commands_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded(1);

        let handle = std::thread::Builder::new()
            .name("dirwatch-dispatch".to_string())
            .spawn(move || dispatcher.run(&commands_rx, &cancel_rx))
            .map_err(|e| Error::internal(format!("failed to spawn dispatch thread: {e}")))?;

        *running = Some(RunningLoop {
            root: root.clone(),
            commands: commands_tx.clone(),
            cancel: cancel_tx,
            handle,
        });
        drop(running);

        tracing::info!(
            root = %root.display(),
            marker = %settings.marker,
            policy = settings.scan_policy.as_str(),
            "Watcher started"
        );

        // A concurrent stop closes the channel and ends the walk early.
        let walk = walk_directory(&root, |found| {
            commands_tx.send(Command::Discovered(found)).is_ok()
        });
        tracing::info!(
            files = walk.files,
            directories = walk.directories,
            errors = walk.errors,
            "Initial walk queued"
        );

        Ok(true)
    }

    /// Stop watching and wait for the loop to release the OS watch.
    ///
    /// Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        let Some(active) = self.running.lock().take() else {
            return false;
        };

        let root = active.root.clone();
        let exit = active.shutdown();
        tracing::info!(root = %root.display(), ?exit, "Watcher stopped");
        true
    }

    /// Whether the dispatch loop is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(RunningLoop::is_alive)
    }

    /// Queue a scan of every file under the watched directory.
    ///
    /// Returns the number of files queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is not running.
    pub fn rescan(&self) -> Result<usize> {
        let (root, commands) = self
            .running
            .lock()
            .as_ref()
            .filter(|active| active.is_alive())
            .map(|active| (active.root.clone(), active.commands.clone()))
            .ok_or_else(|| WatcherError::Dispatch("watcher is not running".to_string()))?;

        let mut queued = 0;
        walk_directory(&root, |found| {
            if found.is_directory {
                return true;
            }
            let sent = commands.send(Command::Rescan(found.path)).is_ok();
            if sent {
                queued += 1;
            }
            sent
        });

        tracing::info!(root = %root.display(), queued, "Rescan queued");
        Ok(queued)
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> WatchSettings {
        self.settings.read().clone()
    }

    /// Replace the settings.
    ///
    /// Marker, interval and policy apply to the next event. A new
    /// directory applies on the next start; returns `true` when the
    /// running loop is watching a different directory than configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the new settings are invalid.
    pub fn reconfigure(&self, settings: WatchSettings) -> Result<bool> {
        settings.validate()?;

        let restart_needed = self.running.lock().as_ref().is_some_and(|active| {
            settings
                .directory
                .canonicalize()
                .map_or(true, |dir| dir != active.root)
        });

        tracing::info!(
            directory = %settings.directory.display(),
            marker = %settings.marker,
            interval = ?settings.scan_interval,
            policy = settings.scan_policy.as_str(),
            restart_needed,
            "Settings updated"
        );
        *self.settings.write() = settings;

        Ok(restart_needed)
    }

    /// Most recently created run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_run(&self) -> Result<Option<TaskRun>> {
        self.db.with_conn(crate::storage::latest_run)
    }

    /// Dispatch loop counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("db", &self.db)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanPolicy;
    use crate::storage::init_storage;
    use crate::watcher::{FileEvent, ManualSource};
    use parking_lot::RwLock;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Engine, ManualSource) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let settings = Arc::new(RwLock::new(WatchSettings {
            directory: tmp.path().to_path_buf(),
            marker: "there you are!!".to_string(),
            scan_interval: Duration::from_secs(300),
            scan_policy: ScanPolicy::Join,
        }));
        let source = ManualSource::new();
        let engine = Engine::with_backend(db, settings, source.factory());
        (tmp, engine, source)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_tmp, engine, _source) = setup();
        assert!(engine.start().unwrap());
        assert!(!engine.start().unwrap());
        assert!(engine.is_running());
        assert!(engine.stop());
        assert!(!engine.stop());
        assert!(!engine.is_running());
    }

    #[test]
    fn test_stop_releases_backend() {
        let (_tmp, engine, source) = setup();
        engine.start().unwrap();
        engine.stop();
        assert_eq!(source.close_count(), 1);
    }

    #[test]
    fn test_initial_walk_scans_files() {
        let (tmp, engine, source) = setup();
        fs::write(tmp.path().join("notes.txt"), "There you are!! there you are!!").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();

        engine.start().unwrap();
        assert!(wait_for(|| engine.stats().scans == 1));
        assert!(wait_for(|| source.added().len() == 3));

        let run = engine.latest_run().unwrap().unwrap();
        assert_eq!(run.magic_string_hits, 2);
        assert!(run.files_added.is_empty());
        engine.stop();
    }

    #[test]
    fn test_start_missing_directory_fails() {
        let (tmp, engine, _source) = setup();
        let mut settings = engine.settings();
        settings.directory = tmp.path().join("missing");
        engine.reconfigure(settings).unwrap();

        assert!(engine.start().is_err());
        assert!(!engine.is_running());
    }

    #[test]
    fn test_settings_reachable_during_initial_walk() {
        let (tmp, engine, _source) = setup();
        for i in 0..2000 {
            fs::write(tmp.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let engine = Arc::new(engine);

        let starter = Arc::clone(&engine);
        let start = std::thread::spawn(move || starter.start());

        assert!(wait_for(|| engine.is_running()));
        let settings = WatchSettings {
            marker: "found you".to_string(),
            ..engine.settings()
        };
        assert!(!engine.reconfigure(settings).unwrap());

        // Stopping mid-walk ends the walk instead of deadlocking.
        assert!(engine.stop());
        assert!(start.join().unwrap().unwrap());
        assert!(!engine.is_running());
        assert_eq!(engine.settings().marker, "found you");
    }

    #[test]
    fn test_rescan_requires_running() {
        let (_tmp, engine, _source) = setup();
        assert!(engine.rescan().is_err());
    }

    #[test]
    fn test_rescan_queues_files() {
        let (tmp, engine, _source) = setup();
        fs::write(tmp.path().join("a.txt"), "there you are!!").unwrap();
        fs::write(tmp.path().join("b.txt"), "nothing").unwrap();

        engine.start().unwrap();
        assert!(wait_for(|| engine.stats().scans == 2));
        assert_eq!(engine.rescan().unwrap(), 2);
        assert!(wait_for(|| engine.stats().scans == 4));

        let run = engine.latest_run().unwrap().unwrap();
        assert_eq!(run.magic_string_hits, 2);
        engine.stop();
    }

    #[test]
    fn test_source_close_then_restart() {
        let (_tmp, engine, source) = setup();
        engine.start().unwrap();
        source.disconnect();
        assert!(wait_for(|| !engine.is_running()));

        // The same source stays closed, so the new loop ends again at once.
        assert!(engine.start().unwrap());
        assert!(engine.stop());
        assert_eq!(source.close_count(), 2);
    }

    #[test]
    fn test_reconfigure_reports_directory_change() {
        let (_tmp, engine, _source) = setup();
        let other = TempDir::new().unwrap();
        engine.start().unwrap();

        let same = engine.settings();
        assert!(!engine.reconfigure(same.clone()).unwrap());

        let moved = WatchSettings {
            directory: other.path().to_path_buf(),
            ..same
        };
        assert!(engine.reconfigure(moved).unwrap());
        engine.stop();
    }

    #[test]
    fn test_reconfigure_rejects_empty_marker() {
        let (_tmp, engine, _source) = setup();
        let settings = WatchSettings {
            marker: String::new(),
            ..engine.settings()
        };
        assert!(engine.reconfigure(settings).is_err());
    }

    #[test]
    fn test_events_flow_through_engine() {
        let (tmp, engine, source) = setup();
        engine.start().unwrap();

        let path = tmp.path().canonicalize().unwrap().join("new.txt");
        fs::write(&path, "x").unwrap();
        source.push(FileEvent::created(&path));

        assert!(wait_for(|| {
            engine
                .latest_run()
                .unwrap()
                .is_some_and(|run| run.files_added == vec!["new.txt"])
        }));
        engine.stop();
    }
}
