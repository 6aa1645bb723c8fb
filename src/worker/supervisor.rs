//! Worker process supervisor.
//!
//! Owns the single worker process of a bridge and walks it through
//! `Absent → Spawning → Running → Exited`. Every spawn gets a new generation
//! number; exit notifications carry the generation they were raised for, so
//! a late notice from a previous worker can never tear down its successor.
//!
//! Per running worker, three background tasks are started:
//! - the stdout reader, routing messages to the [`Correlator`];
//! - the stderr drain, for diagnostics;
//! - the exit monitor, which owns the [`Child`] and kills it on request.
//!
//! The monitor reports an exit only once the reader has routed everything
//! the worker wrote before it went away, so a final `error` line still
//! reaches its call ahead of the process-exited failure.
//!
//! The stdin writer has its own lock. A write blocked on a full pipe never
//! holds the slot, so state queries, exit handling and shutdown proceed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::correlator::Correlator;
use crate::wire::codec::WireCodec;
use crate::wire::protocol::Command;
use crate::worker::reader::{drain_stderr, run_reader, StderrTail, StreamEnd};
use crate::worker::spawner::{spawn_worker, WorkerConnection};
use crate::{AppError, Result};

/// Time a worker gets to act on `SIGTERM` before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// How long the other end of a finished worker gets to catch up: the reader
/// after the process exited, or the process after stdout closed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Worker stdin, framed for commands.
type CommandWriter = Arc<Mutex<FramedWrite<ChildStdin, WireCodec>>>;

/// Observable lifecycle state of the supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker has been started, or it was shut down.
    Absent,
    /// A spawn is in progress.
    Spawning,
    /// The worker is running.
    Running {
        /// Spawn generation.
        generation: u64,
        /// OS process id, if known.
        pid: Option<u32>,
        /// Whether `initialize` succeeded against this process.
        initialized: bool,
    },
    /// The worker ended on its own or after an I/O failure.
    Exited {
        /// Human-readable exit reason.
        reason: String,
    },
}

/// A live worker and the handles needed to talk to and stop it.
struct WorkerProcess {
    generation: u64,
    pid: Option<u32>,
    initialized: bool,
    writer: CommandWriter,
    /// Asks the monitor task to terminate the child.
    kill: CancellationToken,
    monitor: JoinHandle<()>,
}

enum Slot {
    Absent,
    Spawning,
    Running(WorkerProcess),
    Exited { reason: String },
}

struct Inner {
    config: WorkerConfig,
    correlator: Arc<Correlator>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

/// Supervisor for the bridge's single worker process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("interpreter", &self.inner.config.interpreter)
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor; no process is started until [`Supervisor::ensure`].
    #[must_use]
    pub fn new(config: WorkerConfig, correlator: Arc<Correlator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                correlator,
                slot: Mutex::new(Slot::Absent),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Make sure a worker is running, spawning one if needed.
    ///
    /// Returns the generation of the running worker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be started; the
    /// supervisor goes back to `Absent` so the next call retries.
    pub async fn ensure(&self) -> Result<u64> {
        let mut slot = self.inner.slot.lock().await;
        if let Slot::Running(process) = &*slot {
            return Ok(process.generation);
        }

        *slot = Slot::Spawning;
        let connection = match spawn_worker(&self.inner.config) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(%err, "worker spawn failed");
                *slot = Slot::Absent;
                return Err(err);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let process = self.start(generation, connection);
        info!(generation, worker_pid = ?process.pid, "worker running");
        *slot = Slot::Running(process);
        Ok(generation)
    }

    /// Write one command to worker `generation`.
    ///
    /// A failed write means the worker is unusable: it is torn down and any
    /// pending call fails with a process-exited error. Dropping the returned
    /// future mid-write leaves a partial line on the pipe; the caller must
    /// then [`Supervisor::retire`] the worker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unavailable`] if that worker is not running or
    /// the write fails.
    pub async fn send(&self, generation: u64, command: Command) -> Result<()> {
        let name = command.name();
        let writer = match &*self.inner.slot.lock().await {
            Slot::Running(process) if process.generation == generation => {
                Arc::clone(&process.writer)
            }
            _ => {
                return Err(AppError::Unavailable(format!(
                    "cannot send `{name}`: worker is not running"
                )))
            }
        };

        let Err(err) = writer.lock().await.send(command).await else {
            debug!(generation, command = name, "command written");
            return Ok(());
        };

        let reason = format!("write to worker stdin failed: {err}");
        warn!(generation, command = name, %err, "worker write failed");
        self.retire(generation, &reason).await;
        Err(AppError::Unavailable(reason))
    }

    /// Tear down worker `generation` and fail any pending call with `reason`.
    ///
    /// Ignored if that worker has already been replaced or stopped.
    pub async fn retire(&self, generation: u64, reason: &str) {
        let mut slot = self.inner.slot.lock().await;
        if !matches!(&*slot, Slot::Running(p) if p.generation == generation) {
            return;
        }
        if let Slot::Running(process) = std::mem::replace(
            &mut *slot,
            Slot::Exited {
                reason: reason.to_owned(),
            },
        ) {
            process.kill.cancel();
        }
        drop(slot);

        info!(generation, reason, "worker retired");
        self.inner.correlator.worker_gone(reason).await;
    }

    /// Generation of the running worker, if it has completed `initialize`.
    pub async fn initialized_generation(&self) -> Option<u64> {
        match &*self.inner.slot.lock().await {
            Slot::Running(p) if p.initialized => Some(p.generation),
            _ => None,
        }
    }

    /// Whether the running worker has completed `initialize`.
    pub async fn is_initialized(&self) -> bool {
        self.initialized_generation().await.is_some()
    }

    /// Record a successful `initialize` against worker `generation`.
    ///
    /// Ignored if that worker has since been replaced.
    pub async fn mark_initialized(&self, generation: u64) {
        if let Slot::Running(process) = &mut *self.inner.slot.lock().await {
            if process.generation == generation {
                process.initialized = true;
            }
        }
    }

    /// Snapshot of the lifecycle state.
    pub async fn state(&self) -> WorkerState {
        match &*self.inner.slot.lock().await {
            Slot::Absent => WorkerState::Absent,
            Slot::Spawning => WorkerState::Spawning,
            Slot::Running(p) => WorkerState::Running {
                generation: p.generation,
                pid: p.pid,
                initialized: p.initialized,
            },
            Slot::Exited { reason } => WorkerState::Exited {
                reason: reason.clone(),
            },
        }
    }

    /// Stop the worker: send `shutdown`, wait `grace`, then terminate.
    ///
    /// Any pending call fails with a process-exited error. A no-op when no
    /// worker is running; never fails.
    pub async fn shutdown(&self, grace: Duration) {
        let previous = std::mem::replace(&mut *self.inner.slot.lock().await, Slot::Absent);
        let Slot::Running(process) = previous else {
            debug!("shutdown: no running worker");
            return;
        };

        let WorkerProcess {
            generation,
            writer,
            kill,
            mut monitor,
            ..
        } = process;
        info!(generation, "shutting down worker");

        self.inner.correlator.worker_gone("worker shut down").await;

        let farewell = async { writer.lock().await.send(Command::Shutdown).await };
        match tokio::time::timeout(grace, farewell).await {
            Ok(Ok(())) => debug!(generation, "shutdown command written"),
            Ok(Err(err)) => debug!(generation, %err, "shutdown command not delivered"),
            Err(_) => debug!(generation, "shutdown command write timed out"),
        }
        // Closing stdin lets a worker without a shutdown handler see EOF. A
        // write still blocked elsewhere keeps it open until the kill below.
        drop(writer);

        if tokio::time::timeout(grace, &mut monitor).await.is_ok() {
            info!(generation, "worker exited within grace period");
            return;
        }

        kill.cancel();
        if tokio::time::timeout(TERM_GRACE * 2, monitor).await.is_err() {
            warn!(generation, "worker did not confirm termination");
        }
    }

    /// Start the reader, stderr and monitor tasks for a fresh connection.
    fn start(&self, generation: u64, connection: WorkerConnection) -> WorkerProcess {
        let WorkerConnection {
            pid,
            child,
            stdin,
            stdout,
            stderr,
        } = connection;
        let kill = CancellationToken::new();
        let tail = StderrTail::default();

        let reader = tokio::spawn(run_reader(
            generation,
            stdout,
            Arc::clone(&self.inner.correlator),
            kill.clone(),
        ));

        tokio::spawn(drain_stderr(generation, stderr, tail.clone(), kill.clone()));

        let monitor_inner = Arc::clone(&self.inner);
        let monitor_kill = kill.clone();
        let monitor = tokio::spawn(async move {
            let reason = watch_worker(generation, pid, child, reader, monitor_kill).await;
            monitor_inner.on_exit(generation, reason, &tail).await;
        });

        WorkerProcess {
            generation,
            pid,
            initialized: false,
            writer: Arc::new(Mutex::new(FramedWrite::new(stdin, WireCodec::new()))),
            kill,
            monitor,
        }
    }
}

impl Inner {
    /// Record the end of worker `generation` once the monitor has seen it go.
    async fn on_exit(&self, generation: u64, reason: String, tail: &StderrTail) {
        let reason = match tail.last().await {
            Some(line) => format!("{reason} (last stderr: {line})"),
            None => reason,
        };

        let mut slot = self.slot.lock().await;
        let current = matches!(&*slot, Slot::Running(p) if p.generation == generation);
        if !current {
            debug!(generation, %reason, "exit notice for a retired worker, ignoring");
            return;
        }

        if let Slot::Running(process) = std::mem::replace(
            &mut *slot,
            Slot::Exited {
                reason: reason.clone(),
            },
        ) {
            // Stops the reader and stderr drain if they outlived the process.
            process.kill.cancel();
        }
        drop(slot);

        warn!(generation, %reason, "worker exited");
        self.correlator.worker_gone(&reason).await;
    }
}

/// Wait for the worker to end and describe how it ended.
///
/// Whichever of process exit and stdout EOF comes first, the other gets
/// [`DRAIN_GRACE`] to follow. A worker that closed stdout but keeps running
/// is terminated, as is any worker once `kill` fires.
async fn watch_worker(
    generation: u64,
    pid: Option<u32>,
    mut child: Child,
    mut reader: JoinHandle<StreamEnd>,
    kill: CancellationToken,
) -> String {
    tokio::select! {
        biased;

        () = kill.cancelled() => {
            debug!(generation, "monitor: termination requested");
            terminate(pid, &mut child).await;
            "worker terminated".to_owned()
        }

        result = child.wait() => {
            let reason = describe_exit(result);
            if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
                debug!(generation, "monitor: stdout still open after exit, not waiting longer");
            }
            reason
        }

        end = &mut reader => {
            let reason = match end {
                Ok(StreamEnd::Eof) => "worker closed its output stream".to_owned(),
                Ok(StreamEnd::Failed(err)) => format!("worker output stream failed: {err}"),
                Ok(StreamEnd::Cancelled) => "worker reader stopped".to_owned(),
                Err(err) => format!("worker reader task failed: {err}"),
            };
            match tokio::time::timeout(DRAIN_GRACE, child.wait()).await {
                Ok(result) => describe_exit(result),
                Err(_) => {
                    debug!(generation, %reason, "monitor: worker alive without stdout, terminating");
                    terminate(pid, &mut child).await;
                    reason
                }
            }
        }
    }
}

fn describe_exit(result: std::io::Result<std::process::ExitStatus>) -> String {
    match result {
        Ok(status) => status.code().map_or_else(
            || "process terminated by signal".to_owned(),
            |c| format!("process exited with code {c}"),
        ),
        Err(err) => format!("wait error: {err}"),
    }
}

/// Ask politely with `SIGTERM`, then kill.
#[cfg(unix)]
async fn terminate(pid: Option<u32>, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!(pid = raw, %err, "SIGTERM failed");
        } else if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }

    if let Err(err) = child.kill().await {
        debug!(%err, "kill failed; process may already be gone");
    }
}

#[cfg(not(unix))]
async fn terminate(_pid: Option<u32>, child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(%err, "kill failed; process may already be gone");
    }
}
