//! Declarative YAML workflows: parsing, validation, and execution.

use thiserror::Error;

pub mod executor;
pub mod spec;

pub use executor::{ExecutionContext, ExecutionResult, Executor, StepOutcome};
pub use spec::{parse, parse_and_validate, CanConvertSpec, StepSpec, WorkflowSpec};

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("failed to parse workflow YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("workflow validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("failed to hash input file: {0}")]
    Hash(#[from] crate::hash::HashError),

    #[error("can_convert probe failed: {0}")]
    Probe(#[from] crate::process::ProcessError),
}
