//! Worker pool: drains stable-file events into a bounded task queue and
//! runs the per-task conversion pipeline.

use thiserror::Error;

pub mod pool;
pub mod queue;
pub mod task;

pub use pool::{derive_output_path, rebuild_index, WorkerContext, WorkerPool};
pub use queue::TaskQueue;
pub use task::{Task, TaskResult};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("task queue is not accepting new tasks")]
    NotAccepting,

    #[error("task queue is full")]
    QueueFull,

    #[error("task for this path is already queued or in flight")]
    Duplicate,
}
