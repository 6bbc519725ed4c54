//! Runs one external command at a time and streams its output.
//!
//! [`ProcessRunner::start`] spawns `<shell> -c <command>` with stdout and stderr
//! piped and returns at once. A tokio task reads both pipes chunk by chunk and
//! reports [`RunEvent`]s over an unbounded channel: raw chunks, parsed progress
//! times, and finally exactly one [`Outcome`]. No event for a run is ever sent
//! after its outcome.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::QueueConfig;
use crate::error::RunnerError;
use crate::progress;

/// Identifies one invocation of [`ProcessRunner::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipe a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Diagnostic channel, where ffmpeg writes its progress lines
    Stderr,
    /// Used by probing commands
    Stdout,
}

/// Why a run counts as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The shell could not be started
    Spawn(String),
    /// A fatal phrase appeared in the output; the child was killed
    ErrorMarker(String),
    /// Non-zero exit, or `None` when terminated by a signal
    ExitCode(Option<i32>),
    /// Waiting on the child failed
    Io(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Spawn(msg) => write!(f, "failed to start: {}", msg),
            FailureReason::ErrorMarker(marker) => write!(f, "runtime error: {}", marker),
            FailureReason::ExitCode(Some(code)) => write!(f, "exit code {}", code),
            FailureReason::ExitCode(None) => write!(f, "terminated by signal"),
            FailureReason::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(FailureReason),
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed(reason) => write!(f, "failed ({})", reason),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// One read's worth of output, decoded lossily
    Chunk { stream: OutputStream, text: String },
    /// Elapsed time found in the preceding chunk
    Progress { seconds: i64 },
    /// Always the last event of a run
    Outcome(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEvent {
    pub run: RunId,
    pub event: RunEvent,
}

/// Seam between the queue and whatever executes its commands
pub trait CommandRunner {
    /// Start `command` without waiting for it. Fails with [`RunnerError::Busy`] while a run is active.
    fn start(&self, command: &str) -> Result<RunId, RunnerError>;
    /// Forcibly stop the active run, which then reports [`Outcome::Aborted`]. No-op when idle.
    fn cancel(&self);
    fn is_busy(&self) -> bool;
}

enum RunnerState {
    Idle,
    Running {
        run: RunId,
        cancel: Option<oneshot::Sender<()>>,
    },
}

struct Shared {
    state: Mutex<RunnerState>,
    events: mpsc::UnboundedSender<RunnerEvent>,
    error_markers: Vec<String>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        // the state is a plain enum, a panic elsewhere cannot leave it half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, run: RunId, event: RunEvent) {
        if self.events.send(RunnerEvent { run, event }).is_err() {
            debug!("Run {}: event receiver dropped", run);
        }
    }

    /// Forward one chunk and return the error marker it contains, if any
    fn forward(&self, run: RunId, stream: OutputStream, bytes: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let seconds = progress::find_elapsed_seconds(&text);
        let marker = progress::find_error_marker(&text, &self.error_markers).map(str::to_string);

        self.emit(run, RunEvent::Chunk { stream, text });
        if let Some(seconds) = seconds {
            self.emit(run, RunEvent::Progress { seconds });
        }
        marker
    }
}

/// Executes shell commands one at a time on a background task
pub struct ProcessRunner {
    shell: PathBuf,
    read_buffer_size: usize,
    next_run: AtomicU64,
    shared: Arc<Shared>,
}

impl ProcessRunner {
    /// Create a runner and the receiving end of its event stream
    pub fn new(cfg: &QueueConfig) -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Self {
            shell: cfg.shell.clone(),
            read_buffer_size: cfg.read_buffer_size.max(1),
            next_run: AtomicU64::new(1),
            shared: Arc::new(Shared {
                state: Mutex::new(RunnerState::Idle),
                events: tx,
                error_markers: cfg.error_markers.clone(),
            }),
        };
        (runner, rx)
    }

    fn spawn_child(&self, command: &str) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // own process group, so a kill reaches whatever the shell started
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }
}

impl CommandRunner for ProcessRunner {
    fn start(&self, command: &str) -> Result<RunId, RunnerError> {
        let mut state = self.shared.lock_state();
        if let RunnerState::Running { run, .. } = *state {
            debug!("Refusing to start while run {} is active", run);
            return Err(RunnerError::Busy);
        }

        let run = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        debug!("Run {}: {} -c {}", run, self.shell.display(), command);

        let mut child = match self.spawn_child(command) {
            Ok(child) => child,
            Err(source) => {
                warn!("Run {}: failed to spawn command: {}", run, source);
                drop(state);
                self.shared.emit(
                    run,
                    RunEvent::Outcome(Outcome::Failed(FailureReason::Spawn(source.to_string()))),
                );
                return Err(RunnerError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let stderr = child.stderr.take();
        let stdout = child.stdout.take();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *state = RunnerState::Running {
            run,
            cancel: Some(cancel_tx),
        };
        drop(state);

        info!("Run {}: started (pid {:?})", run, child.id());

        let watcher = Watcher {
            run,
            shared: Arc::clone(&self.shared),
            buffer_size: self.read_buffer_size,
        };
        tokio::spawn(watcher.watch(child, stderr, stdout, cancel_rx));

        Ok(run)
    }

    fn cancel(&self) {
        let mut state = self.shared.lock_state();
        match &mut *state {
            RunnerState::Running { run, cancel } => match cancel.take() {
                Some(tx) => {
                    info!("Run {}: cancelling", run);
                    // the watcher may have finished in the meantime; nothing to stop then
                    let _ = tx.send(());
                }
                None => debug!("Run {}: cancel already requested", run),
            },
            RunnerState::Idle => debug!("Cancel requested with nothing running"),
        }
    }

    fn is_busy(&self) -> bool {
        matches!(*self.shared.lock_state(), RunnerState::Running { .. })
    }
}

/// Background half of a run: reads the pipes, then reaps the child
struct Watcher {
    run: RunId,
    shared: Arc<Shared>,
    buffer_size: usize,
}

impl Watcher {
    async fn watch<E, O>(
        self,
        mut child: Child,
        mut stderr: Option<E>,
        mut stdout: Option<O>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) where
        E: AsyncRead + Unpin,
        O: AsyncRead + Unpin,
    {
        let run = self.run;
        let mut err_buf = vec![0u8; self.buffer_size];
        let mut out_buf = vec![0u8; self.buffer_size];
        let mut cancelled = false;
        let mut marker: Option<String> = None;

        while stderr.is_some() || stdout.is_some() {
            tokio::select! {
                read = read_chunk(&mut stderr, &mut err_buf) => match read {
                    Ok(0) => stderr = None,
                    Ok(n) => {
                        marker = self.shared.forward(run, OutputStream::Stderr, &err_buf[..n]);
                    }
                    Err(e) => {
                        warn!("Run {}: reading stderr failed: {}", run, e);
                        stderr = None;
                    }
                },
                read = read_chunk(&mut stdout, &mut out_buf) => match read {
                    Ok(0) => stdout = None,
                    Ok(n) => {
                        marker = self.shared.forward(run, OutputStream::Stdout, &out_buf[..n]);
                    }
                    Err(e) => {
                        warn!("Run {}: reading stdout failed: {}", run, e);
                        stdout = None;
                    }
                },
                _ = &mut cancel_rx, if !cancelled => {
                    cancelled = true;
                }
            }

            if cancelled || marker.is_some() {
                break;
            }
        }

        if let Some(found) = &marker {
            warn!("Run {}: '{}' detected, killing", run, found);
            kill(&mut child);
        } else if cancelled {
            kill(&mut child);
        }

        let status = if cancelled || marker.is_some() {
            child.wait().await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = &mut cancel_rx => {
                    cancelled = true;
                    kill(&mut child);
                    child.wait().await
                }
            }
        };

        let outcome = if cancelled {
            Outcome::Aborted
        } else if let Some(found) = marker {
            Outcome::Failed(FailureReason::ErrorMarker(found))
        } else {
            match status {
                Ok(status) if status.success() => Outcome::Success,
                Ok(status) => Outcome::Failed(FailureReason::ExitCode(status.code())),
                Err(e) => Outcome::Failed(FailureReason::Io(e.to_string())),
            }
        };

        info!("Run {}: {}", run, outcome);

        // idle before the outcome goes out, so its consumer can start the next run right away
        *self.shared.lock_state() = RunnerState::Idle;
        self.shared.emit(run, RunEvent::Outcome(outcome));
    }
}

/// Read from a pipe that may already be closed; a closed pipe never completes
async fn read_chunk<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn kill(child: &mut Child) {
    kill_group(child);
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}
