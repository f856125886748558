//! Filesystem watcher: native watches plus debouncing.
//!
//! Raw create/write events put candidate files into a pending map; a
//! background tick promotes entries whose (size, mtime) held still for
//! the stability delay into "stable file" events. A periodic full scan
//! catches anything the native watches missed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use walkdir::WalkDir;

use crate::hash::stat_sample;

/// Capacity of the stable-event channel. Emission is non-blocking; on
/// overflow events are logged and dropped.
const EVENT_QUEUE_CAP: usize = 1000;

/// Cadence of the stability tick.
const STABILITY_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to initialize native watcher: {0}")]
    Init(#[from] notify::Error),
}

/// How a stable file was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Debounced native watch event.
    Watch,
    /// Periodic or manual full scan.
    Scan,
}

/// A file judged stable and ready for conversion.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub origin: EventOrigin,
    pub observed_at: DateTime<Utc>,
}

struct PendingFile {
    last_size: u64,
    last_mtime: SystemTime,
    first_seen: Instant,
}

pub struct FileWatcher {
    watch_dirs: Vec<PathBuf>,
    media_extensions: Vec<String>,
    stability_delay: Duration,
    poll_interval: Duration,
    events_tx: Option<Sender<FileEvent>>,
    events_rx: Receiver<FileEvent>,
    pending: Arc<Mutex<HashMap<PathBuf, PendingFile>>>,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    scan_tx: Sender<()>,
    scan_rx: Receiver<()>,
    native: Option<Arc<Mutex<RecommendedWatcher>>>,
    threads: Vec<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn new(
        watch_dirs: Vec<PathBuf>,
        media_extensions: Vec<String>,
        stability_delay: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAP);
        let (scan_tx, scan_rx) = unbounded();

        Self {
            watch_dirs,
            media_extensions,
            stability_delay,
            poll_interval,
            events_tx: Some(events_tx),
            events_rx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            paused: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            scan_tx,
            scan_rx,
            native: None,
            threads: Vec::new(),
        }
    }

    /// The stable-file event stream. The channel closes when the watcher
    /// stops.
    pub fn events(&self) -> Receiver<FileEvent> {
        self.events_rx.clone()
    }

    /// Suppresses event emission; watch-set maintenance continues.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("watcher paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("watcher resumed");
    }

    /// Schedules an immediate full scan.
    pub fn trigger_scan(&self) {
        let _ = self.scan_tx.send(());
    }

    /// Registers native watches for every reachable directory and starts
    /// the background loops.
    pub fn start(&mut self) -> Result<(), WatchError> {
        let (raw_tx, raw_rx) = unbounded::<notify::Result<Event>>();

        let handler = move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        };
        let mut native = notify::recommended_watcher(handler)?;

        let watched = {
            let mut watched = HashSet::new();
            for root in &self.watch_dirs {
                add_recursive(&mut native, root, &mut watched);
            }
            watched
        };
        info!("watcher started, monitoring {} directories", watched.len());

        let native = Arc::new(Mutex::new(native));
        self.native = Some(Arc::clone(&native));

        self.spawn_event_loop(raw_rx, native, watched);
        self.spawn_stability_loop();
        self.spawn_scan_loop();

        Ok(())
    }

    /// Graceful stop: cancel background loops, close the stable-event
    /// channel, release native watch handles.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("watcher thread panicked during shutdown");
            }
        }
        if let Some(native) = self.native.take() {
            drop(native);
        }
        self.events_tx = None;
        info!("watcher stopped");
    }

    fn spawn_event_loop(
        &mut self,
        raw_rx: Receiver<notify::Result<Event>>,
        native: Arc<Mutex<RecommendedWatcher>>,
        mut watched: HashSet<PathBuf>,
    ) {
        let shutdown = Arc::clone(&self.shutdown);
        let pending = Arc::clone(&self.pending);
        let media_extensions = self.media_extensions.clone();

        let handle = std::thread::spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match raw_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(event)) => handle_raw_event(
                    &event,
                    &native,
                    &mut watched,
                    &pending,
                    &media_extensions,
                ),
                Ok(Err(e)) => warn!("watch error: {e}"),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        });
        self.threads.push(handle);
    }

    fn spawn_stability_loop(&mut self) {
        let shutdown = Arc::clone(&self.shutdown);
        let paused = Arc::clone(&self.paused);
        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone().expect("started once");
        let stability_delay = self.stability_delay;

        let handle = std::thread::spawn(move || loop {
            std::thread::sleep(STABILITY_TICK);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let mut emitted = Vec::new();

            for (path, entry) in map.iter_mut() {
                if now.duration_since(entry.first_seen) < stability_delay {
                    continue;
                }

                match stat_sample(path) {
                    None => {
                        // File disappeared; forget it.
                        emitted.push((path.clone(), false));
                    }
                    Some((size, mtime)) => {
                        if size == entry.last_size && mtime == entry.last_mtime {
                            if paused.load(Ordering::Relaxed) {
                                continue;
                            }
                            let event = FileEvent {
                                path: path.clone(),
                                origin: EventOrigin::Watch,
                                observed_at: Utc::now(),
                            };
                            match events_tx.try_send(event) {
                                Ok(()) => emitted.push((path.clone(), true)),
                                Err(_) => {
                                    warn!(
                                        "stable-event queue full, deferring {}",
                                        path.display()
                                    );
                                }
                            }
                        } else {
                            entry.last_size = size;
                            entry.last_mtime = mtime;
                        }
                    }
                }
            }

            for (path, stable) in emitted {
                if stable {
                    debug!("stable file: {}", path.display());
                }
                map.remove(&path);
            }
        });
        self.threads.push(handle);
    }

    fn spawn_scan_loop(&mut self) {
        let shutdown = Arc::clone(&self.shutdown);
        let paused = Arc::clone(&self.paused);
        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone().expect("started once");
        let scan_rx = self.scan_rx.clone();
        let watch_dirs = self.watch_dirs.clone();
        let media_extensions = self.media_extensions.clone();
        let poll_interval = self.poll_interval;

        let handle = std::thread::spawn(move || {
            let ticker = crossbeam_channel::tick(poll_interval);

            // Initial scan picks up files that predate the watches.
            scan_directories(&watch_dirs, &media_extensions, &pending, &paused, &events_tx);

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                crossbeam_channel::select! {
                    recv(ticker) -> _ => scan_directories(
                        &watch_dirs, &media_extensions, &pending, &paused, &events_tx,
                    ),
                    recv(scan_rx) -> msg => match msg {
                        Ok(()) => scan_directories(
                            &watch_dirs, &media_extensions, &pending, &paused, &events_tx,
                        ),
                        Err(_) => break,
                    },
                    default(Duration::from_millis(100)) => continue,
                }
            }
        });
        self.threads.push(handle);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

fn is_media_file(path: &Path, media_extensions: &[String]) -> bool {
    path.extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_lowercase();
            media_extensions.iter().any(|m| m == &ext)
        })
        .unwrap_or(false)
}

fn add_recursive(
    native: &mut RecommendedWatcher,
    root: &Path,
    watched: &mut HashSet<PathBuf>,
) {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path().to_path_buf();
        if watched.contains(&dir) {
            continue;
        }
        match native.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                watched.insert(dir);
            }
            Err(e) => warn!("failed to watch directory {}: {e}", dir.display()),
        }
    }
}

fn handle_raw_event(
    event: &Event,
    native: &Arc<Mutex<RecommendedWatcher>>,
    watched: &mut HashSet<PathBuf>,
    pending: &Arc<Mutex<HashMap<PathBuf, PendingFile>>>,
    media_extensions: &[String],
) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in &event.paths {
        // Directory creation extends the watch set; registration is
        // idempotent via the watched set.
        if path.is_dir() {
            if matches!(event.kind, EventKind::Create(_)) {
                let mut guard = native.lock().unwrap_or_else(PoisonError::into_inner);
                add_recursive(&mut guard, path, watched);
            }
            continue;
        }

        if !is_media_file(path, media_extensions) {
            continue;
        }

        let Some((size, mtime)) = stat_sample(path) else {
            continue;
        };

        let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(path.clone()).or_insert_with(|| {
            debug!("candidate file: {}", path.display());
            PendingFile {
                last_size: size,
                last_mtime: mtime,
                first_seen: Instant::now(),
            }
        });
    }
}

fn scan_directories(
    watch_dirs: &[PathBuf],
    media_extensions: &[String],
    pending: &Arc<Mutex<HashMap<PathBuf, PendingFile>>>,
    paused: &Arc<AtomicBool>,
    events_tx: &Sender<FileEvent>,
) {
    if paused.load(Ordering::Relaxed) {
        return;
    }
    debug!("starting directory scan");

    for root in watch_dirs {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_media_file(path, media_extensions) {
                continue;
            }

            // Files still under debounce keep waiting; the scan only
            // emits for files with no pending state (their writes have
            // clearly settled).
            {
                let map = pending.lock().unwrap_or_else(PoisonError::into_inner);
                if map.contains_key(path) {
                    continue;
                }
            }

            let event = FileEvent {
                path: path.to_path_buf(),
                origin: EventOrigin::Scan,
                observed_at: Utc::now(),
            };
            if events_tx.try_send(event).is_err() {
                warn!("stable-event queue full during scan, skipping {}", path.display());
            }
        }
    }

    debug!("directory scan completed");
}
