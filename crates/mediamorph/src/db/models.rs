//! Row types for the persistent store.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

/// Lifecycle state of an indexed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Skipped,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Success => "success",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "success" => Some(FileStatus::Success),
            "failed" => Some(FileStatus::Failed),
            "skipped" => Some(FileStatus::Skipped),
            _ => None,
        }
    }
}

/// Terminal state of a worker-attempted conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }
}

/// State of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

macro_rules! impl_status_sql {
    ($ty:ident) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                $ty::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

impl_status_sql!(FileStatus);
impl_status_sql!(TaskStatus);
impl_status_sql!(RunStatus);

/// One row per observed source path.
#[derive(Debug, Clone)]
pub struct FileIndexEntry {
    pub id: i64,
    pub file_path: String,
    pub content_hash: String,
    pub status: FileStatus,
    pub converter_name: Option<String>,
    pub metadata_preserved: bool,
    pub metadata_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only row per worker-attempted conversion.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub file_path: String,
    pub converter_name: Option<String>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub console_output: String,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A stored user-declared workflow.
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub spec_yaml: String,
    pub enabled: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A historical snapshot of a workflow's spec text.
#[derive(Debug, Clone)]
pub struct WorkflowVersionRow {
    pub id: i64,
    pub workflow_id: i64,
    pub spec_yaml: String,
    pub edited_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row per workflow execution against a file.
#[derive(Debug, Clone)]
pub struct WorkflowRunRow {
    pub id: i64,
    pub workflow_id: i64,
    pub workflow_name: String,
    pub file_path: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
    pub metadata_preserved: bool,
    pub metadata_summary: Option<String>,
    pub job_params: Option<String>,
}

/// Aggregate counts over the file index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_files: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    pub processing_count: i64,
    pub skipped_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Processing,
            FileStatus::Success,
            FileStatus::Failed,
            FileStatus::Skipped,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn test_task_status_round_trip() {
        for status in [TaskStatus::Success, TaskStatus::Failed, TaskStatus::Skipped] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
    }
}
