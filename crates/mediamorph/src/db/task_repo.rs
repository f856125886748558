//! Task-history repository. Rows are append-only; nothing updates them
//! after insert.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::models::{TaskRecord, TaskStatus};
use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct NewTaskRecord {
    pub file_path: String,
    pub converter_name: Option<String>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub console_output: String,
    pub duration_ms: i64,
}

fn from_row(row: &Row<'_>) -> Result<TaskRecord, rusqlite::Error> {
    Ok(TaskRecord {
        id: row.get("id")?,
        file_path: row.get("file_path")?,
        converter_name: row.get("converter_name")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
        console_output: row.get("console_output")?,
        duration_ms: row.get("duration_ms")?,
        created_at: row.get("created_at")?,
    })
}

pub fn insert(db: &Database, record: &NewTaskRecord) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO tasks_history
                 (file_path, converter_name, status, error_message,
                  console_output, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.file_path,
                record.converter_name,
                record.status,
                record.error_message,
                record.console_output,
                record.duration_ms,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Lists task records, newest first.
pub fn list(db: &Database, limit: u32, offset: u32) -> Result<Vec<TaskRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks_history ORDER BY created_at DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    })
}

pub fn find_by_id(db: &Database, id: i64) -> Result<Option<TaskRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let record = conn
            .query_row(
                "SELECT * FROM tasks_history WHERE id = ?1",
                params![id],
                from_row,
            )
            .optional()?;
        Ok(record)
    })
}

/// Lists task records for one path, newest first.
pub fn list_for_path(
    db: &Database,
    file_path: &str,
    limit: u32,
) -> Result<Vec<TaskRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks_history WHERE file_path = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![file_path, limit], from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    })
}
