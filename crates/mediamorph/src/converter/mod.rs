//! Converters: the capability trait, shared option/result types, the
//! registry, and the concrete variants (built-in and workflow-backed).

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::process::CancelFlag;

pub mod builtin;
pub mod jpeg2heic;
pub mod registry;
pub mod workflow;

pub use builtin::{available_builtin_converters, register_builtin_converters};
pub use jpeg2heic::Jpeg2HeicConverter;
pub use registry::ConverterRegistry;
pub use workflow::WorkflowConverter;

/// Options for one conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Quality setting (1-100) for converters that honor it.
    pub quality: u8,
    /// Whether to attempt full-metadata preservation (else only the
    /// critical field).
    pub preserve_metadata: bool,
    /// Root for per-run temporary directories.
    pub temp_dir: PathBuf,
    /// Upper bound for the conversion.
    pub timeout: Duration,
    /// Chunk size for content hashing inside the run.
    pub hash_chunk_size: usize,
}

/// Metadata outcome of a successful conversion.
#[derive(Debug, Clone, Default)]
pub struct MetaResult {
    pub metadata_preserved: bool,
    pub metadata_summary: String,
    /// Detailed log of the conversion, persisted with the task record.
    pub conversion_log: String,
}

#[derive(Error, Debug)]
pub enum ConvertError {
    /// No enabled converter claims the file.
    #[error("no converter found for file: {0}")]
    NoConverter(PathBuf),

    /// A registry operation referenced a name that is not registered.
    #[error("converter not found: {0}")]
    UnknownConverter(String),

    /// The conversion ran and failed: non-zero exit, spawn failure,
    /// timeout, or cancellation. Carries the captured log so the task
    /// record stays diagnosable.
    #[error("{message}")]
    Failed { message: String, log: String },
}

impl ConvertError {
    pub fn failed(message: impl Into<String>, log: impl Into<String>) -> Self {
        ConvertError::Failed {
            message: message.into(),
            log: log.into(),
        }
    }

    /// The captured conversion log, if any.
    pub fn log(&self) -> &str {
        match self {
            ConvertError::Failed { log, .. } => log,
            _ => "",
        }
    }
}

/// A converter transforms one source file into one destination file in a
/// different format. Implementations must write atomically: produce a
/// temporary output, then move it into place, so a failure never leaves a
/// partial file at the final name.
pub trait Converter: Send + Sync {
    /// Unique converter name.
    fn name(&self) -> String;

    /// Extension of the output format, without the dot.
    fn target_format(&self) -> String;

    /// Whether this converter claims the given source file.
    fn can_convert(&self, src: &Path, mime: Option<&str>) -> bool;

    /// Converts `src` into `dst`.
    fn convert(
        &self,
        cancel: &CancelFlag,
        src: &Path,
        dst: &Path,
        opts: &ConvertOptions,
    ) -> Result<MetaResult, ConvertError>;
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterInfo {
    pub name: String,
    pub target_format: String,
    pub enabled: bool,
}
