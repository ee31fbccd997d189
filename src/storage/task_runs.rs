//! Task run storage.
//!
//! Free functions over a `&Connection`, so the aggregator can compose
//! them inside `Database::with_transaction` when a unit must be atomic.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use super::models::{RunMutation, RunStatus, TaskRun};
use crate::error::StorageError;
use crate::Result;

const RUN_COLUMNS: &str = "id, start_time, end_time, files_added, files_deleted, \
                           magic_string_hits, status, opened_by";

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let end_time: Option<i64> = row.get(2)?;
    let files_added: String = row.get(3)?;
    let files_deleted: String = row.get(4)?;
    let hits: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    let opened_by: String = row.get(7)?;

    Ok(TaskRun {
        id: Some(row.get(0)?),
        start_time: from_millis(row.get(1)?)?,
        end_time: end_time.map(from_millis).transpose()?,
        files_added: serde_json::from_str(&files_added).map_err(|e| conversion_error(3, e))?,
        files_deleted: serde_json::from_str(&files_deleted).map_err(|e| conversion_error(4, e))?,
        magic_string_hits: u64::try_from(hits).unwrap_or_default(),
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        opened_by: opened_by.parse().map_err(|e| conversion_error(7, e))?,
    })
}

fn hits_param(hits: u64) -> Result<i64> {
    i64::try_from(hits)
        .map_err(|_| StorageError::Database(format!("hit count {hits} out of range")).into())
}

/// Insert a new run and return its id.
///
/// # Errors
///
/// Returns an error if the insert fails, including when another run is
/// already in progress.
pub fn create_run(conn: &Connection, run: &TaskRun) -> Result<i64> {
    let files_added = serde_json::to_string(&run.files_added)
        .map_err(|e| StorageError::Database(format!("failed to serialize files_added: {e}")))?;
    let files_deleted = serde_json::to_string(&run.files_deleted)
        .map_err(|e| StorageError::Database(format!("failed to serialize files_deleted: {e}")))?;

    conn.execute(
        "INSERT INTO task_runs (start_time, end_time, files_added, files_deleted, \
         magic_string_hits, status, opened_by) VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            to_millis(run.start_time),
            run.end_time.map(to_millis),
            files_added,
            files_deleted,
            hits_param(run.magic_string_hits)?,
            run.status.as_str(),
            run.opened_by.as_str(),
        ],
    )
    .map_err(|e| StorageError::Database(format!("failed to create run: {e}")))?;

    Ok(conn.last_insert_rowid())
}

/// Get a run by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_run(conn: &Connection, id: i64) -> Result<Option<TaskRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?"),
        [id],
        row_to_run,
    )
    .optional()
    .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// Find the run currently in progress, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn find_active_run(conn: &Connection) -> Result<Option<TaskRun>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE status = 'in_progress' \
             ORDER BY start_time DESC, id DESC LIMIT 1"
        ),
        [],
        row_to_run,
    )
    .optional()
    .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// Get the most recently created run regardless of status.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn latest_run(conn: &Connection) -> Result<Option<TaskRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM task_runs ORDER BY id DESC LIMIT 1"),
        [],
        row_to_run,
    )
    .optional()
    .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// List the most recent runs, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<TaskRun>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs ORDER BY id DESC LIMIT ?"
        ))
        .map_err(|e| StorageError::Database(e.to_string()))?;

    let runs = stmt
        .query_map([limit], row_to_run)
        .map_err(|e| StorageError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(e.to_string()))?;

    Ok(runs)
}

/// Count runs with the given status.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_runs_by_status(conn: &Connection, status: RunStatus) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM task_runs WHERE status = ?",
        [status.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// Count all runs.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_runs(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM task_runs", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// Apply a single mutation to a run.
///
/// Appends and hit increments move the run back to `in_progress` and clear
/// its end time; `Finish` sets the terminal status and end time.
///
/// # Errors
///
/// Returns an error if the update fails or no run has the given id.
pub fn update_run(conn: &Connection, id: i64, mutation: &RunMutation) -> Result<()> {
    const REOPEN: &str = "status = 'in_progress', end_time = NULL";

    let changed = match mutation {
        RunMutation::AppendAdded(path) => conn.execute(
            &format!(
                "UPDATE task_runs SET files_added = json_insert(files_added, '$[#]', ?1), \
                 {REOPEN} WHERE id = ?2"
            ),
            rusqlite::params![path, id],
        ),
        RunMutation::AppendDeleted(path) => conn.execute(
            &format!(
                "UPDATE task_runs SET files_deleted = json_insert(files_deleted, '$[#]', ?1), \
                 {REOPEN} WHERE id = ?2"
            ),
            rusqlite::params![path, id],
        ),
        RunMutation::AddHits(hits) => conn.execute(
            &format!(
                "UPDATE task_runs SET magic_string_hits = magic_string_hits + ?1, \
                 {REOPEN} WHERE id = ?2"
            ),
            rusqlite::params![hits_param(*hits)?, id],
        ),
        RunMutation::Finish { status, at } => conn.execute(
            "UPDATE task_runs SET status = ?1, end_time = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), to_millis(*at), id],
        ),
    }
    .map_err(|e| StorageError::Database(format!("failed to update run {id}: {e}")))?;

    if changed == 0 {
        return Err(StorageError::not_found("task_run", id.to_string()).into());
    }

    Ok(())
}
