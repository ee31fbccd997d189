//! Task run aggregation.
//!
//! The aggregator owns the notion of "the active run". Only the dispatch
//! loop calls it. The partial unique index on `task_runs` enforces the
//! single-active invariant at the storage level.

use std::time::Duration;

use rusqlite::Connection;

use crate::config::{ScanPolicy, WatchSettings};
use crate::server::metrics::RUN_WRITES_TOTAL;
use crate::storage::{
    create_run, find_active_run, latest_run, now, update_run, Database, RunMutation,
    RunStatus, RunTrigger, TaskRun,
};
use crate::Result;

/// Applies scan results and path changes to task runs.
#[derive(Debug)]
pub struct Aggregator {
    db: Database,
    policy: ScanPolicy,
    window: Duration,
}

impl Aggregator {
    /// Create an aggregator using the policy and window from `settings`.
    #[must_use]
    pub fn new(db: Database, settings: &WatchSettings) -> Self {
        Self {
            db,
            policy: settings.scan_policy,
            window: settings.scan_interval,
        }
    }

    /// Pick up a new policy and window. The active run is left as it is.
    pub fn reconfigure(&mut self, settings: &WatchSettings) {
        self.policy = settings.scan_policy;
        self.window = settings.scan_interval;
    }

    /// Current scan policy.
    #[must_use]
    pub const fn policy(&self) -> ScanPolicy {
        self.policy
    }

    /// Record a content scan of `path` that found `hits` markers.
    ///
    /// Runs as one transaction: the run is written `in_progress`, then
    /// finalized to `success`. If any write fails the whole unit rolls
    /// back and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the unit could not be committed.
    pub fn record_scan(&self, path: &str, hits: u64) -> Result<i64> {
        let result = self.db.with_transaction(|conn| {
            let id = match self.policy {
                ScanPolicy::Join => match self.locate(conn)? {
                    Some(id) => {
                        update_run(conn, id, &RunMutation::AddHits(hits))?;
                        id
                    }
                    None => create_run(conn, &TaskRun::begin(RunTrigger::Scan).with_hits(hits))?,
                },
                ScanPolicy::Fresh => {
                    if let Some(superseded) = find_active_run(conn)?.and_then(|r| r.id) {
                        update_run(conn, superseded, &RunMutation::succeed())?;
                        tracing::info!(run_id = superseded, "Superseded in-progress run");
                    }
                    create_run(conn, &TaskRun::begin(RunTrigger::Scan).with_hits(hits))?
                }
            };

            update_run(conn, id, &RunMutation::succeed())?;
            Ok(id)
        });

        match &result {
            Ok(id) => {
                RUN_WRITES_TOTAL.with_label_values(&["scan", "success"]).inc();
                tracing::info!(run_id = id, path, hits, "Recorded scan");
            }
            Err(e) => {
                RUN_WRITES_TOTAL.with_label_values(&["scan", "failed"]).inc();
                tracing::error!(path, hits, error = %e, "Scan rolled back");
            }
        }

        result
    }

    /// Record that `path` was created.
    ///
    /// # Errors
    ///
    /// Returns a storage error from whichever write failed.
    pub fn record_addition(&self, path: &str) -> Result<i64> {
        self.record_activity("addition", RunMutation::AppendAdded(path.to_string()))
    }

    /// Record that `path` was deleted.
    ///
    /// # Errors
    ///
    /// Returns a storage error from whichever write failed.
    pub fn record_deletion(&self, path: &str) -> Result<i64> {
        self.record_activity("deletion", RunMutation::AppendDeleted(path.to_string()))
    }

    /// Latest run regardless of status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_run(&self) -> Result<Option<TaskRun>> {
        self.db.with_conn(latest_run)
    }

    /// Find-or-create, append, then finalize. The three steps are separate
    /// writes: a failure after the append leaves the run `in_progress` with
    /// the path recorded, and the next call picks it up again.
    fn record_activity(&self, operation: &'static str, mutation: RunMutation) -> Result<i64> {
        let (id, created) = self.db.with_conn(|conn| match self.locate(conn)? {
            Some(id) => Ok((id, false)),
            None => Ok((create_run(conn, &TaskRun::begin(RunTrigger::Activity))?, true)),
        })?;

        if let Err(e) = self.db.with_conn(|conn| update_run(conn, id, &mutation)) {
            RUN_WRITES_TOTAL.with_label_values(&[operation, "failed"]).inc();
            tracing::error!(run_id = id, operation, error = %e, "Failed to append path");
            if created {
                if let Err(fail) = self.db.with_conn(|conn| update_run(conn, id, &RunMutation::fail())) {
                    tracing::error!(run_id = id, error = %fail, "Failed to mark run failed");
                }
            }
            return Err(e);
        }

        if let Err(e) = self.db.with_conn(|conn| update_run(conn, id, &RunMutation::succeed())) {
            RUN_WRITES_TOTAL.with_label_values(&[operation, "failed"]).inc();
            tracing::error!(run_id = id, operation, error = %e, "Run left in progress");
            return Err(e);
        }

        RUN_WRITES_TOTAL.with_label_values(&[operation, "success"]).inc();
        tracing::info!(run_id = id, operation, created, "Recorded path change");
        Ok(id)
    }

    /// The run new effects should land on, if one exists.
    ///
    /// In order: the run in progress; otherwise the latest run when it is
    /// not failed, started within the window and, under the fresh policy,
    /// was opened by activity rather than a scan.
    fn locate(&self, conn: &Connection) -> Result<Option<i64>> {
        if let Some(active) = find_active_run(conn)? {
            return Ok(active.id);
        }

        let Some(latest) = latest_run(conn)? else {
            return Ok(None);
        };

        if latest.status == RunStatus::Failed {
            return Ok(None);
        }
        if self.policy == ScanPolicy::Fresh && latest.opened_by == RunTrigger::Scan {
            return Ok(None);
        }

        let age = (now() - latest.start_time).to_std().unwrap_or_default();
        if age < self.window {
            tracing::debug!(run_id = ?latest.id, ?age, "Rejoining recent run");
            Ok(latest.id)
        } else {
            Ok(None)
        }
    }
}
