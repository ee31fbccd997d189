//! `SQLite` database connection management.
//!
//! Provides a connection wrapper configured with:
//! - WAL mode so API reads do not stall the dispatch loop's writes
//! - A single shared connection behind `parking_lot::Mutex`
//! - Immediate transactions for all-or-nothing units

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use crate::error::StorageError;
use crate::Result;

/// Database connection wrapper.
///
/// Clone is cheap - it just clones the Arc.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    /// Open a database at the given path.
    ///
    /// Creates the database file and parent directories if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::Database(format!("failed to open database: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string_lossy().to_string(),
        };
        db.configure()?;

        Ok(db)
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StorageError::Database(format!("failed to open in-memory database: {e}"))
        })?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: ":memory:".to_string(),
        };
        db.configure()?;

        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                PRAGMA temp_store = MEMORY;
                ",
            )
            .map_err(|e| StorageError::Database(format!("failed to configure database: {e}")))?;

        tracing::debug!(path = %self.path, "Database configured with WAL mode");
        Ok(())
    }

    /// Execute a function with exclusive database access.
    ///
    /// # Errors
    ///
    /// Returns an error if the function fails.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside an immediate transaction.
    ///
    /// Commits if `f` succeeds; rolls back every write `f` made otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot begin or commit, or if
    /// the function fails.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StorageError::Database(format!("failed to begin transaction: {e}")))?;

        match f(&conn) {
            Ok(result) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(StorageError::Database(format!("failed to commit: {e}")).into());
                }
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Get the database path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StorageError::Database(format!("health check failed: {e}")).into())
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{count_runs, create_run, migrate, RunTrigger, TaskRun};
    use tempfile::TempDir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.path(), ":memory:");
        db.health_check().unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dirs").join("test.db");

        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        db.health_check().unwrap();
    }

    #[test]
    fn test_with_transaction_commit() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(migrate).unwrap();

        db.with_transaction(|conn| create_run(conn, &TaskRun::begin(RunTrigger::Scan)))
            .unwrap();

        assert_eq!(db.with_conn(count_runs).unwrap(), 1);
    }

    #[test]
    fn test_with_transaction_rollback() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(migrate).unwrap();

        let result: Result<()> = db.with_transaction(|conn| {
            create_run(conn, &TaskRun::begin(RunTrigger::Scan))?;
            Err(crate::Error::internal("simulated failure"))
        });

        assert!(result.is_err());
        assert_eq!(db.with_conn(count_runs).unwrap(), 0);
    }

    #[test]
    fn test_clone_shares_connection() {
        let db1 = Database::open_in_memory().unwrap();
        db1.with_conn(migrate).unwrap();
        db1.with_conn(|conn| create_run(conn, &TaskRun::begin(RunTrigger::Activity)))
            .unwrap();

        let db2 = db1.clone();
        assert_eq!(db2.with_conn(count_runs).unwrap(), 1);
    }
}
