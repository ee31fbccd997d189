//! `SQLite` storage for task runs.
//!
//! The aggregator is the only writer; the control API reads.

mod connection;
mod models;
mod schema;
mod task_runs;

pub use connection::Database;
pub use models::{now, RunMutation, RunStatus, RunTrigger, TaskRun};
pub use schema::{migrate, verify_schema, SCHEMA_VERSION};
pub use task_runs::{
    count_runs, count_runs_by_status, create_run, find_active_run, get_run, latest_run,
    list_runs, update_run,
};

/// Initialize storage with migrations.
///
/// # Errors
///
/// Returns an error if database initialization fails.
pub fn init_storage(db: &Database) -> crate::Result<()> {
    db.with_conn(|conn| {
        migrate(conn)?;
        verify_schema(conn)?;

        tracing::info!("Storage initialized, schema version {SCHEMA_VERSION}");
        Ok(())
    })
}
