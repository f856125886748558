//! The worker pool and the per-task conversion pipeline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::converter::{ConvertError, ConvertOptions, ConverterRegistry};
use crate::db::file_index_repo::{self, FileIndexUpsert};
use crate::db::task_repo::{self, NewTaskRecord};
use crate::db::{Database, FileStatus, TaskStatus};
use crate::fsops;
use crate::hash;
use crate::process::{new_cancel_flag, CancelFlag};

use super::queue::TaskQueue;
use super::task::{Task, TaskResult};
use super::WorkerError;

/// Everything a worker needs to run the pipeline.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub registry: Arc<ConverterRegistry>,
    pub quality: u8,
    pub preserve_metadata: bool,
    pub temp_dir: PathBuf,
    pub convert_timeout: Duration,
    pub hash_chunk_size: usize,
    pub watch_dirs: Vec<PathBuf>,
}

impl WorkerContext {
    pub fn from_config(
        config: &Config,
        db: Arc<Database>,
        registry: Arc<ConverterRegistry>,
    ) -> Self {
        Self {
            db,
            registry,
            quality: config.convert_quality,
            preserve_metadata: config.preserve_metadata,
            temp_dir: config.temp_dir.clone(),
            convert_timeout: config.convert_timeout,
            hash_chunk_size: config.hash_chunk_size,
            watch_dirs: config.watch_dirs.clone(),
        }
    }

    fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            quality: self.quality,
            preserve_metadata: self.preserve_metadata,
            temp_dir: self.temp_dir.clone(),
            timeout: self.convert_timeout,
            hash_chunk_size: self.hash_chunk_size,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    cancel: CancelFlag,
    results_rx: Receiver<TaskResult>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers consuming from a bounded queue.
    /// Zero workers is valid: tasks accumulate and never complete.
    pub fn new(ctx: WorkerContext, worker_count: usize, queue_capacity: usize) -> Self {
        let queue = Arc::new(TaskQueue::new(queue_capacity));
        let (results_tx, results_rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let cancel = new_cancel_flag();

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let results_tx = results_tx.clone();
            let stop = Arc::clone(&stop);
            let cancel = Arc::clone(&cancel);
            let ctx = ctx.clone();

            workers.push(std::thread::spawn(move || {
                run_worker(worker_id, ctx, queue, results_tx, stop, cancel);
            }));
        }

        info!("started {worker_count} conversion workers");

        Self {
            queue,
            workers,
            stop,
            cancel,
            results_rx,
        }
    }

    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        self.queue.enqueue(task)
    }

    /// Shared handle to the task queue, for producers that outlive a
    /// borrow of the pool (the supervisor's event forwarder).
    pub fn queue_handle(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    /// Shared handle to the result stream.
    pub fn results_handle(&self) -> Receiver<TaskResult> {
        self.results_rx.clone()
    }

    pub fn try_recv_result(&self) -> Option<TaskResult> {
        self.results_rx.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        self.results_rx.recv_timeout(timeout).ok()
    }

    /// Queued-or-in-flight task count.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Stops accepting new tasks; queued tasks still drain.
    pub fn stop_accepting(&self) {
        self.queue.stop_accepting();
    }

    /// Cancels in-flight conversions (their child processes are
    /// terminated).
    pub fn cancel_inflight(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Stops the workers and joins them. Call after draining.
    pub fn wait(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for (i, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                error!("worker {i} panicked");
            }
        }
        info!("all workers stopped");
    }
}

fn run_worker(
    worker_id: usize,
    ctx: WorkerContext,
    queue: Arc<TaskQueue>,
    results_tx: Sender<TaskResult>,
    stop: Arc<AtomicBool>,
    cancel: CancelFlag,
) {
    debug!("worker {worker_id} started");
    let receiver = queue.receiver();

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => {
                debug!(
                    "worker {worker_id} processing {} (task {})",
                    task.file_path.display(),
                    task.id
                );
                let result = process_task(&ctx, &cancel, &task);
                queue.mark_done(&task.file_path);
                if results_tx.send(result).is_err() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("worker {worker_id} stopped");
}

/// The per-task pipeline: hash, dedup check, converter lookup, index
/// transitions, conversion, and record keeping.
///
/// Failures scoped to this task are persisted and returned; they never
/// unwind into the worker loop.
fn process_task(ctx: &WorkerContext, cancel: &CancelFlag, task: &Task) -> TaskResult {
    let start = Instant::now();
    let path = &task.file_path;
    let path_str = path.to_string_lossy().into_owned();

    // 1. Content hash. On failure the file is left for a future scan;
    // nothing is recorded.
    let content_hash = match hash::file_digest(path, ctx.hash_chunk_size) {
        Ok(digest) => digest,
        Err(e) => {
            warn!("hash failed for {}, leaving for a future scan: {e}", path.display());
            return TaskResult::new(task, TaskStatus::Failed).with_error(e.to_string());
        }
    };

    // 2. Dedup: an unchanged file that already converted successfully is
    // skipped.
    let existing = match file_index_repo::find_by_path(&ctx.db, &path_str) {
        Ok(entry) => entry,
        Err(e) => {
            error!("index lookup failed for {}: {e}", path.display());
            return TaskResult::new(task, TaskStatus::Failed).with_error(e.to_string());
        }
    };

    if let Some(entry) = &existing {
        if entry.status == FileStatus::Success && entry.content_hash == content_hash {
            debug!("skipping {}: already converted with matching hash", path.display());
            record_task(
                ctx,
                &NewTaskRecord {
                    file_path: path_str,
                    converter_name: entry.converter_name.clone(),
                    status: TaskStatus::Skipped,
                    error_message: None,
                    console_output: "task skipped: file already processed successfully"
                        .to_string(),
                    duration_ms: elapsed_ms(start),
                },
            );
            let mut result = TaskResult::new(task, TaskStatus::Skipped);
            if let Some(name) = &entry.converter_name {
                result = result.with_converter(name.clone());
            }
            return result;
        }
    }

    // 3. Converter lookup.
    let converter = match ctx.registry.find(path, None) {
        Ok(converter) => converter,
        Err(e) => {
            warn!("{e}");
            upsert_index(
                ctx,
                FileIndexUpsert::new(&path_str, &content_hash, FileStatus::Failed),
            );
            record_task(
                ctx,
                &NewTaskRecord {
                    file_path: path_str,
                    converter_name: None,
                    status: TaskStatus::Failed,
                    error_message: Some(e.to_string()),
                    console_output: e.to_string(),
                    duration_ms: elapsed_ms(start),
                },
            );
            return TaskResult::new(task, TaskStatus::Failed).with_error(e.to_string());
        }
    };
    let converter_name = converter.name();

    // 4. Claim the path. The upsert discards any earlier success against
    // a different hash.
    let mut claim = FileIndexUpsert::new(&path_str, &content_hash, FileStatus::Processing);
    claim.converter_name = Some(converter_name.clone());
    upsert_index(ctx, claim.clone());

    // 5. Destination, with a timestamp suffix if it is already taken.
    let destination = fsops::unique_destination(&derive_output_path(path, &converter.target_format()));
    debug!("converting {} -> {}", path.display(), destination.display());

    // 6. Convert.
    let outcome = converter.convert(cancel, path, &destination, &ctx.convert_options());
    let duration_ms = elapsed_ms(start);

    match outcome {
        Ok(meta) => {
            // 7. Success: index + task record.
            claim.status = FileStatus::Success;
            claim.metadata_preserved = meta.metadata_preserved;
            claim.metadata_summary = Some(meta.metadata_summary.clone());
            upsert_index(ctx, claim);

            record_task(
                ctx,
                &NewTaskRecord {
                    file_path: path_str,
                    converter_name: Some(converter_name.clone()),
                    status: TaskStatus::Success,
                    error_message: None,
                    console_output: meta.conversion_log,
                    duration_ms,
                },
            );

            info!(
                "converted {} -> {} ({converter_name}, {duration_ms}ms)",
                path.display(),
                destination.display()
            );
            TaskResult::new(task, TaskStatus::Success).with_converter(converter_name)
        }
        Err(e) => {
            // 8. Failure: index + task record with captured log.
            claim.status = FileStatus::Failed;
            upsert_index(ctx, claim);

            let mut console_output = e.log().to_string();
            if console_output.is_empty() {
                console_output = format!("Error: {e}");
            } else {
                console_output.push_str(&format!("\n\nError: {e}"));
            }

            record_task(
                ctx,
                &NewTaskRecord {
                    file_path: path_str,
                    converter_name: Some(converter_name.clone()),
                    status: TaskStatus::Failed,
                    error_message: Some(e.to_string()),
                    console_output,
                    duration_ms,
                },
            );

            warn!("conversion failed for {}: {e}", path.display());
            TaskResult::new(task, TaskStatus::Failed)
                .with_converter(converter_name)
                .with_error(e.to_string())
        }
    }
}

/// Derives the destination for a source file:
/// `/a/b/c/photo.jpg` with target `heic` becomes `/a/b/heic/photo.heic`.
pub fn derive_output_path(src: &Path, target_format: &str) -> PathBuf {
    let dir = src.parent().unwrap_or(Path::new("/"));
    let parent = dir.parent().unwrap_or(dir);
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());

    parent
        .join(target_format)
        .join(format!("{stem}.{target_format}"))
}

/// Admin-triggered index rebuild: wipes the index (task history and
/// workflow state survive), rescans all roots, and inserts every
/// convertible file as pending. The caller is responsible for pausing
/// the watcher around this.
pub fn rebuild_index(ctx: &WorkerContext) -> Result<usize, crate::error::MediamorphError> {
    info!("starting index rebuild over {} roots", ctx.watch_dirs.len());
    file_index_repo::clear(&ctx.db)?;

    let mut indexed = 0usize;

    for root in &ctx.watch_dirs {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            let converter = match ctx.registry.find(path, None) {
                Ok(converter) => converter,
                Err(ConvertError::NoConverter(_)) => continue,
                Err(e) => {
                    warn!("converter lookup failed for {}: {e}", path.display());
                    continue;
                }
            };

            let content_hash = match hash::file_digest(path, ctx.hash_chunk_size) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("skipping {} during rebuild: {e}", path.display());
                    continue;
                }
            };

            let path_str = path.to_string_lossy();
            if let Ok(Some(existing)) = file_index_repo::find_by_path(&ctx.db, &path_str) {
                if existing.content_hash == content_hash {
                    continue;
                }
            }

            let mut pending = FileIndexUpsert::new(&path_str, &content_hash, FileStatus::Pending);
            pending.converter_name = Some(converter.name());
            if let Err(e) = file_index_repo::upsert(&ctx.db, &pending) {
                warn!("failed to index {}: {e}", path.display());
                continue;
            }
            indexed += 1;
        }
    }

    info!("index rebuild completed, {indexed} files indexed");
    Ok(indexed)
}

fn upsert_index(ctx: &WorkerContext, entry: FileIndexUpsert) {
    if let Err(e) = file_index_repo::upsert(&ctx.db, &entry) {
        error!("failed to upsert index entry for {}: {e}", entry.file_path);
    }
}

fn record_task(ctx: &WorkerContext, record: &NewTaskRecord) {
    if let Err(e) = task_repo::insert(&ctx.db, record) {
        error!("failed to record task for {}: {e}", record.file_path);
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}
