//! Shared harness for integration tests: isolated directories, an
//! in-memory store, a registry, and a stub converter.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mediamorph::converter::{ConvertError, ConvertOptions, Converter, MetaResult};
use mediamorph::db::Database;
use mediamorph::process::CancelFlag;
use mediamorph::worker::{Task, TaskResult, WorkerContext, WorkerPool};
use mediamorph::watcher::EventOrigin;
use mediamorph::ConverterRegistry;

/// Bytes written by [`StubConverter`] on success.
pub const STUB_OUTPUT: &[u8] = b"converted-by-stub";

/// A converter that claims one extension and copies a fixed payload to
/// the destination through a temp file and rename.
pub struct StubConverter {
    pub name: &'static str,
    pub claims_extension: &'static str,
    pub target: &'static str,
    pub fail: bool,
}

impl StubConverter {
    pub fn claiming(extension: &'static str, target: &'static str) -> Self {
        Self {
            name: "stub",
            claims_extension: extension,
            target,
            fail: false,
        }
    }
}

impl Converter for StubConverter {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn target_format(&self) -> String {
        self.target.to_string()
    }

    fn can_convert(&self, src: &Path, _mime: Option<&str>) -> bool {
        src.extension()
            .map(|e| e.to_string_lossy().to_lowercase() == self.claims_extension)
            .unwrap_or(false)
    }

    fn convert(
        &self,
        _cancel: &CancelFlag,
        _src: &Path,
        dst: &Path,
        opts: &ConvertOptions,
    ) -> Result<MetaResult, ConvertError> {
        if self.fail {
            return Err(ConvertError::failed("stub converter failure", "stub log"));
        }

        let staging = opts.temp_dir.join(format!(
            "stub-{}.partial",
            uuid_like(dst)
        ));
        std::fs::write(&staging, STUB_OUTPUT)
            .map_err(|e| ConvertError::failed(e.to_string(), ""))?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConvertError::failed(e.to_string(), ""))?;
        }
        std::fs::rename(&staging, dst).map_err(|e| ConvertError::failed(e.to_string(), ""))?;

        Ok(MetaResult {
            metadata_preserved: true,
            metadata_summary: "stubbed".to_string(),
            conversion_log: "stub conversion ok".to_string(),
        })
    }
}

fn uuid_like(path: &Path) -> String {
    // Enough uniqueness for parallel test conversions.
    path.to_string_lossy()
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
        .to_string()
}

/// Isolated environment for driving the worker pipeline.
pub struct TestHarness {
    temp_dir: TempDir,
    pub watch_root: PathBuf,
    pub temp_root: PathBuf,
    pub db: Arc<Database>,
    pub registry: Arc<ConverterRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let watch_root = temp_dir.path().join("watch");
        let temp_root = temp_dir.path().join("tmp");
        std::fs::create_dir_all(&watch_root).expect("failed to create watch root");
        std::fs::create_dir_all(&temp_root).expect("failed to create temp root");

        Self {
            temp_dir,
            watch_root,
            temp_root,
            db: Arc::new(Database::open_in_memory().expect("failed to open store")),
            registry: Arc::new(ConverterRegistry::new()),
        }
    }

    pub fn with_converter(converter: impl Converter + 'static) -> Self {
        let harness = Self::new();
        harness.registry.register(Arc::new(converter));
        harness
    }

    pub fn base_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            db: Arc::clone(&self.db),
            registry: Arc::clone(&self.registry),
            quality: 90,
            preserve_metadata: true,
            temp_dir: self.temp_root.clone(),
            convert_timeout: Duration::from_secs(60),
            hash_chunk_size: 8192,
            watch_dirs: vec![self.watch_root.clone()],
        }
    }

    pub fn spawn_pool(&self, workers: usize) -> WorkerPool {
        WorkerPool::new(self.worker_context(), workers, 64)
    }

    /// Writes a file under the watch root, creating parent directories.
    pub fn write_media(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.watch_root.join(relative);
        std::fs::create_dir_all(path.parent().expect("relative path has a parent"))
            .expect("failed to create parents");
        std::fs::write(&path, content).expect("failed to write media file");
        path
    }

    /// Submits one path and waits for its result.
    pub fn convert_and_wait(&self, pool: &WorkerPool, path: &Path) -> TaskResult {
        pool.submit(Task::new(path.to_path_buf(), EventOrigin::Watch))
            .expect("submit failed");
        pool.recv_result_timeout(Duration::from_secs(15))
            .expect("timed out waiting for a task result")
    }
}
