//! Persistent store for the file index, task history, workflows, and
//! workflow runs.
//!
//! A single SQLite connection behind a mutex: the store is single-writer
//! by construction, which is the correct discipline for an embedded
//! database shared by a handful of worker threads doing short local
//! writes.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

pub mod error;
pub mod file_index_repo;
pub mod migrations;
pub mod models;
pub mod task_repo;
pub mod workflow_repo;

pub use error::DatabaseError;
pub use models::{
    FileIndexEntry, FileStatus, RunStatus, Stats, TaskRecord, TaskStatus, WorkflowRow,
    WorkflowRunRow, WorkflowVersionRow,
};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (creating if needed) the store at `path` and applies pending
    /// migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store. Used by tests and by callers that want a
    /// throwaway index.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DatabaseError> {
        configure_pragmas(&conn)?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a closure against the serialized connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Flushes the WAL into the main database file. Called once during
    /// shutdown.
    pub fn checkpoint(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
    }
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/store/mediamorph.db");

        let db = Database::open(&path).unwrap();
        drop(db);

        assert!(path.exists());
    }

    #[test]
    fn test_reopen_preserves_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mediamorph.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();

        let count: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM files_index", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_checkpoint_succeeds() {
        let db = Database::open_in_memory().unwrap();
        db.checkpoint().unwrap();
    }
}
