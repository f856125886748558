pub mod config;
pub mod converter;
pub mod db;
pub mod error;
pub mod fsops;
pub mod hash;
pub mod metadata;
pub mod process;
pub mod supervisor;
pub mod watcher;
pub mod worker;
pub mod workflow;

pub use config::{load_config, Config, ConfigError};
pub use converter::{ConvertError, ConvertOptions, Converter, ConverterRegistry, MetaResult};
pub use error::{MediamorphError, Result};
pub use process::CancelFlag;
pub use supervisor::Supervisor;
pub use workflow::{ExecutionContext, ExecutionResult, WorkflowError, WorkflowSpec};
