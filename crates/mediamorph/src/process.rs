//! Shell command execution with bounded output capture, deadlines, and
//! cancellation.
//!
//! Converters and workflow steps run external programs through `/bin/sh -c`.
//! A misbehaving child must not be able to exhaust memory (capture is
//! capped) or outlive the daemon (SIGTERM, then SIGKILL after a grace
//! window).

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;
use thiserror::Error;

/// Cooperative cancellation flag threaded through blocking operations.
pub type CancelFlag = Arc<AtomicBool>;

/// Creates a fresh, unset cancellation flag.
pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// Cap per captured stream; past this, bytes are discarded and the capture
/// is marked truncated.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";
const KILL_GRACE: Duration = Duration::from_secs(2);
const POLL_TICK: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// A shell command to run: `/bin/sh -c <command>` in `workdir`, inheriting
/// the process environment augmented by `envs`.
pub struct ShellCommand<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    pub envs: &'a [(String, String)],
    /// Absolute deadline; past it the child is terminated.
    pub deadline: Option<Instant>,
    /// Cooperative cancellation; when set the child is terminated.
    pub cancel: Option<&'a CancelFlag>,
}

impl<'a> ShellCommand<'a> {
    pub fn new(command: &'a str, workdir: &'a Path) -> Self {
        Self {
            command,
            workdir,
            envs: &[],
            deadline: None,
            cancel: None,
        }
    }
}

/// Outcome of a finished (or terminated) shell command.
#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Runs a shell command to completion, enforcing deadline and cancellation.
///
/// Termination is two-phase: SIGTERM first, SIGKILL if the child has not
/// exited within the grace window. A spawn failure is an error; a non-zero
/// exit is a normal outcome.
pub fn run_shell(cmd: &ShellCommand<'_>) -> Result<CommandOutcome, ProcessError> {
    let start = Instant::now();

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd.command)
        .current_dir(cmd.workdir)
        .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ProcessError::Spawn)?;

    let stdout_handle = child.stdout.take().map(spawn_capture);
    let stderr_handle = child.stderr.take().map(spawn_capture);

    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        if let Some(status) = child.try_wait().map_err(ProcessError::Wait)? {
            break status;
        }

        let past_deadline = cmd.deadline.is_some_and(|d| Instant::now() >= d);
        let cancel_requested = cmd.cancel.is_some_and(|c| c.load(Ordering::Relaxed));

        if past_deadline || cancel_requested {
            timed_out = past_deadline;
            cancelled = cancel_requested && !past_deadline;
            break terminate(&mut child)?;
        }

        std::thread::sleep(POLL_TICK);
    };

    let stdout = join_capture(stdout_handle);
    let stderr = join_capture(stderr_handle);

    Ok(CommandOutcome {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}

/// Terminates a child: SIGTERM, bounded wait, then SIGKILL.
fn terminate(child: &mut Child) -> Result<std::process::ExitStatus, ProcessError> {
    // SAFETY: the pid belongs to a child we spawned and have not yet reaped.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let grace_end = Instant::now() + KILL_GRACE;
    while Instant::now() < grace_end {
        if let Some(status) = child.try_wait().map_err(ProcessError::Wait)? {
            return Ok(status);
        }
        std::thread::sleep(POLL_TICK);
    }

    if let Err(e) = child.kill() {
        warn!("failed to SIGKILL child {}: {}", child.id(), e);
    }
    child.wait().map_err(ProcessError::Wait)
}

fn spawn_capture(mut stream: impl Read + Send + 'static) -> JoinHandle<(Vec<u8>, bool)> {
    std::thread::spawn(move || {
        let mut captured = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];

        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if captured.len() < MAX_CAPTURE_BYTES {
                        let room = MAX_CAPTURE_BYTES - captured.len();
                        captured.extend_from_slice(&buf[..n.min(room)]);
                        if n > room {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }

        (captured, truncated)
    })
}

fn join_capture(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };

    match handle.join() {
        Ok((bytes, truncated)) => {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            text
        }
        Err(_) => String::new(),
    }
}

/// Quotes a value for safe interpolation into a shell command: single
/// quotes with embedded single quotes escaped.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Inverse of [`shell_quote`] for values used as filesystem paths rather
/// than command arguments. Values not wrapped in single quotes are
/// returned unchanged.
pub fn shell_unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("'\\''", "'")
    } else {
        value.to_string()
    }
}
