//! Workflow, workflow-version, and workflow-run repositories.
//!
//! Every create/update snapshots the spec text into `workflow_versions`.
//! Deleting a workflow cascades to its versions and runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::models::{RunStatus, WorkflowRow, WorkflowRunRow, WorkflowVersionRow};
use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: String,
    pub spec_yaml: String,
    pub enabled: bool,
    pub created_by: Option<String>,
}

fn workflow_from_row(row: &Row<'_>) -> Result<WorkflowRow, rusqlite::Error> {
    Ok(WorkflowRow {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        spec_yaml: row.get("spec_yaml")?,
        enabled: row.get("enabled")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn version_from_row(row: &Row<'_>) -> Result<WorkflowVersionRow, rusqlite::Error> {
    Ok(WorkflowVersionRow {
        id: row.get("id")?,
        workflow_id: row.get("workflow_id")?,
        spec_yaml: row.get("spec_yaml")?,
        edited_by: row.get("edited_by")?,
        created_at: row.get("created_at")?,
    })
}

fn run_from_row(row: &Row<'_>) -> Result<WorkflowRunRow, rusqlite::Error> {
    Ok(WorkflowRunRow {
        id: row.get("id")?,
        workflow_id: row.get("workflow_id")?,
        workflow_name: row.get("workflow_name")?,
        file_path: row.get("file_path")?,
        status: row.get("status")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration_ms: row.get("duration_ms")?,
        exit_code: row.get("exit_code")?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        logs: row.get("logs")?,
        metadata_preserved: row.get("metadata_preserved")?,
        metadata_summary: row.get("metadata_summary")?,
        job_params: row.get("job_params")?,
    })
}

/// Inserts a workflow and its initial version snapshot.
pub fn create(db: &Database, workflow: &NewWorkflow) -> Result<WorkflowRow, DatabaseError> {
    db.with_conn(|conn| {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO workflows
                 (name, description, spec_yaml, enabled, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                workflow.name,
                workflow.description,
                workflow.spec_yaml,
                workflow.enabled,
                workflow.created_by,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        insert_version(conn, id, &workflow.spec_yaml, workflow.created_by.as_deref())?;

        let row = conn.query_row(
            "SELECT * FROM workflows WHERE id = ?1",
            params![id],
            workflow_from_row,
        )?;
        Ok(row)
    })
}

/// Updates a workflow in place and snapshots the new spec text.
pub fn update(
    db: &Database,
    id: i64,
    workflow: &NewWorkflow,
) -> Result<WorkflowRow, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE workflows SET name = ?2, description = ?3, spec_yaml = ?4,
                 enabled = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                workflow.name,
                workflow.description,
                workflow.spec_yaml,
                workflow.enabled,
                Utc::now(),
            ],
        )?;

        insert_version(conn, id, &workflow.spec_yaml, workflow.created_by.as_deref())?;

        let row = conn.query_row(
            "SELECT * FROM workflows WHERE id = ?1",
            params![id],
            workflow_from_row,
        )?;
        Ok(row)
    })
}

fn insert_version(
    conn: &rusqlite::Connection,
    workflow_id: i64,
    spec_yaml: &str,
    edited_by: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO workflow_versions (workflow_id, spec_yaml, edited_by, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![workflow_id, spec_yaml, edited_by, Utc::now()],
    )?;
    Ok(())
}

pub fn find_by_id(db: &Database, id: i64) -> Result<Option<WorkflowRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM workflows WHERE id = ?1",
                params![id],
                workflow_from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn find_by_name(db: &Database, name: &str) -> Result<Option<WorkflowRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM workflows WHERE name = ?1",
                params![name],
                workflow_from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list(db: &Database, limit: u32, offset: u32) -> Result<Vec<WorkflowRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM workflows ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], workflow_from_row)?;

        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row?);
        }
        Ok(workflows)
    })
}

pub fn list_enabled(db: &Database) -> Result<Vec<WorkflowRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM workflows WHERE enabled = 1 ORDER BY id")?;
        let rows = stmt.query_map([], workflow_from_row)?;

        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row?);
        }
        Ok(workflows)
    })
}

/// Deletes a workflow; versions and runs go with it via cascade.
pub fn delete(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}

pub fn list_versions(
    db: &Database,
    workflow_id: i64,
    limit: u32,
) -> Result<Vec<WorkflowVersionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM workflow_versions WHERE workflow_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![workflow_id, limit], version_from_row)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    })
}

#[derive(Debug, Clone)]
pub struct NewWorkflowRun {
    pub workflow_id: i64,
    pub workflow_name: String,
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    pub job_params: Option<String>,
}

/// Inserts a run in `running` state at executor entry.
pub fn create_run(db: &Database, run: &NewWorkflowRun) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO workflow_runs
                 (workflow_id, workflow_name, file_path, status, start_time, job_params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.workflow_id,
                run.workflow_name,
                run.file_path,
                RunStatus::Running,
                run.start_time,
                run.job_params,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Everything written once at executor exit.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
    pub metadata_preserved: bool,
    pub metadata_summary: Option<String>,
}

pub fn complete_run(
    db: &Database,
    run_id: i64,
    completion: &RunCompletion,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE workflow_runs SET status = ?2, end_time = ?3, duration_ms = ?4,
                 exit_code = ?5, stdout = ?6, stderr = ?7, logs = ?8,
                 metadata_preserved = ?9, metadata_summary = ?10
             WHERE id = ?1",
            params![
                run_id,
                completion.status,
                completion.end_time,
                completion.duration_ms,
                completion.exit_code,
                completion.stdout,
                completion.stderr,
                completion.logs,
                completion.metadata_preserved,
                completion.metadata_summary,
            ],
        )?;
        Ok(())
    })
}

pub fn find_run(db: &Database, id: i64) -> Result<Option<WorkflowRunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM workflow_runs WHERE id = ?1",
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_runs(
    db: &Database,
    workflow_id: i64,
    limit: u32,
    offset: u32,
) -> Result<Vec<WorkflowRunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM workflow_runs WHERE workflow_id = ?1
             ORDER BY start_time DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![workflow_id, limit, offset], run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    })
}

pub fn list_all_runs(
    db: &Database,
    limit: u32,
    offset: u32,
) -> Result<Vec<WorkflowRunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM workflow_runs
             ORDER BY start_time DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    })
}
