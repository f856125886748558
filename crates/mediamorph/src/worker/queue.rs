//! Bounded, de-duplicating task queue.
//!
//! A path is refused while a task for it is already queued or in flight,
//! and everything is refused once draining has begun.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::{Task, WorkerError};

pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    inflight: Mutex<HashSet<PathBuf>>,
    accepting: AtomicBool,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            inflight: Mutex::new(HashSet::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Enqueues a task without blocking.
    pub fn enqueue(&self, task: Task) -> Result<(), WorkerError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(WorkerError::NotAccepting);
        }

        {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if !inflight.insert(task.file_path.clone()) {
                return Err(WorkerError::Duplicate);
            }
        }

        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                self.inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task.file_path);
                Err(WorkerError::QueueFull)
            }
        }
    }

    /// Marks a path as no longer in flight. Workers call this after the
    /// task reaches a terminal state.
    pub fn mark_done(&self, path: &Path) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Stops accepting new tasks; queued tasks still drain.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    pub fn receiver(&self) -> Receiver<Task> {
        self.rx.clone()
    }

    /// Number of queued-or-in-flight paths.
    pub fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
