use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediamorphError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] crate::workflow::WorkflowError),

    #[error("Conversion error: {0}")]
    Convert(#[from] crate::converter::ConvertError),

    #[error("Watcher error: {0}")]
    Watch(#[from] crate::watcher::WatchError),

    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    #[error("Hash error: {0}")]
    Hash(#[from] crate::hash::HashError),
}

pub type Result<T> = std::result::Result<T, MediamorphError>;
