//! File-index repository — one row per observed source path.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::models::{FileIndexEntry, FileStatus, Stats};
use super::{Database, DatabaseError};

/// Fields written on every upsert; `created_at` is only set on first
/// insert, `updated_at` always.
#[derive(Debug, Clone)]
pub struct FileIndexUpsert {
    pub file_path: String,
    pub content_hash: String,
    pub status: FileStatus,
    pub converter_name: Option<String>,
    pub metadata_preserved: bool,
    pub metadata_summary: Option<String>,
}

impl FileIndexUpsert {
    pub fn new(file_path: &str, content_hash: &str, status: FileStatus) -> Self {
        Self {
            file_path: file_path.to_string(),
            content_hash: content_hash.to_string(),
            status,
            converter_name: None,
            metadata_preserved: false,
            metadata_summary: None,
        }
    }
}

fn from_row(row: &Row<'_>) -> Result<FileIndexEntry, rusqlite::Error> {
    Ok(FileIndexEntry {
        id: row.get("id")?,
        file_path: row.get("file_path")?,
        content_hash: row.get("content_hash")?,
        status: row.get("status")?,
        converter_name: row.get("converter_name")?,
        metadata_preserved: row.get("metadata_preserved")?,
        metadata_summary: row.get("metadata_summary")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Inserts or updates the entry for a path. The upsert is the single
/// mutation point for index state, which keeps per-path transitions
/// linearized under the store's serialized writer.
pub fn upsert(db: &Database, entry: &FileIndexUpsert) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO files_index
                 (file_path, content_hash, status, converter_name,
                  metadata_preserved, metadata_summary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(file_path) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 status = excluded.status,
                 converter_name = excluded.converter_name,
                 metadata_preserved = excluded.metadata_preserved,
                 metadata_summary = excluded.metadata_summary,
                 updated_at = excluded.updated_at",
            params![
                entry.file_path,
                entry.content_hash,
                entry.status,
                entry.converter_name,
                entry.metadata_preserved,
                entry.metadata_summary,
                now,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM files_index WHERE file_path = ?1",
            params![entry.file_path],
            |r| r.get(0),
        )?;
        Ok(id)
    })
}

/// Finds the entry for a path.
pub fn find_by_path(db: &Database, file_path: &str) -> Result<Option<FileIndexEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let entry = conn
            .query_row(
                "SELECT * FROM files_index WHERE file_path = ?1",
                params![file_path],
                from_row,
            )
            .optional()?;
        Ok(entry)
    })
}

/// Lists entries, optionally filtered by status, newest activity first.
pub fn list(
    db: &Database,
    status: Option<FileStatus>,
    limit: u32,
    offset: u32,
) -> Result<Vec<FileIndexEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut entries = Vec::new();

        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM files_index WHERE status = ?1
                     ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![status, limit, offset], from_row)?;
                for row in rows {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM files_index
                     ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], from_row)?;
                for row in rows {
                    entries.push(row?);
                }
            }
        }

        Ok(entries)
    })
}

/// Aggregate status counts over the whole index.
pub fn stats(db: &Database) -> Result<Stats, DatabaseError> {
    db.with_conn(|conn| {
        let stats = conn.query_row(
            "SELECT
                 COUNT(*),
                 SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                 SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                 SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                 SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END),
                 SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END)
             FROM files_index",
            [],
            |row| {
                Ok(Stats {
                    total_files: row.get(0)?,
                    success_count: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    failed_count: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    pending_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    processing_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    skipped_count: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                })
            },
        )?;
        Ok(stats)
    })
}

/// Wipes the index. Task history and workflow state are untouched.
pub fn clear(db: &Database) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM files_index", [])?;
        Ok(())
    })
}
