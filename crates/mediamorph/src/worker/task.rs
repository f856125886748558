//! Task types flowing through the worker pool.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::db::TaskStatus;
use crate::watcher::{EventOrigin, FileEvent};

/// One unit of work: convert a single stable file.
#[derive(Debug, Clone)]
pub struct Task {
    /// Correlation id, carried into logs.
    pub id: String,
    pub file_path: PathBuf,
    pub origin: EventOrigin,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(file_path: PathBuf, origin: EventOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path,
            origin,
            enqueued_at: Utc::now(),
        }
    }

    pub fn from_event(event: FileEvent) -> Self {
        Self::new(event.path, event.origin)
    }
}

/// Terminal outcome of one task, mirrored into the store and surfaced on
/// the pool's result channel.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub file_path: PathBuf,
    pub status: TaskStatus,
    pub converter_name: Option<String>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn new(task: &Task, status: TaskStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            file_path: task.file_path.clone(),
            status,
            converter_name: None,
            error: None,
        }
    }

    pub fn with_converter(mut self, name: impl Into<String>) -> Self {
        self.converter_name = Some(name.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
