//! Bridge facade: the public `initialize` / `execute` / `shutdown` contract.
//!
//! Composes the [`Supervisor`], [`Correlator`] and [`Sanitizer`] and adds
//! deadline enforcement and cancellation wiring. Calls are serialised here:
//! a second `initialize`/`execute` waits for the one in flight to resolve
//! instead of competing for the correlator's single slot.
//!
//! `execute` before a successful `initialize` fails with
//! [`AppError::NotInitialized`]; it never starts or initializes a worker on
//! its own. After a worker exit the caller must `initialize` again.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::correlator::{CallEvent, CallHandle, CallKind, Correlator};
use crate::sanitize::Sanitizer;
use crate::wire::protocol::Command;
use crate::worker::path::translate_path;
use crate::worker::spawner::{self, ProbeReport};
use crate::worker::supervisor::{Supervisor, WorkerState};
use crate::{AppError, Result};

/// Persistent bridge to one worker process.
#[derive(Debug)]
pub struct WorkerBridge {
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    supervisor: Supervisor,
    sanitizer: Sanitizer,
    /// Serialises `initialize` and `execute`.
    calls: Mutex<()>,
}

impl WorkerBridge {
    /// Build a bridge. No process is started until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the configuration is invalid.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let sanitizer = Sanitizer::new(&config.sanitizer.extra_patterns)?;
        let correlator = Arc::new(Correlator::new());
        let supervisor = Supervisor::new(config.worker.clone(), Arc::clone(&correlator));

        Ok(Self {
            config,
            correlator,
            supervisor,
            sanitizer,
            calls: Mutex::new(()),
        })
    }

    /// Cheap availability check of the worker interpreter.
    ///
    /// # Errors
    ///
    /// See [`spawner::probe`].
    pub async fn probe(&self) -> Result<ProbeReport> {
        spawner::probe(&self.config).await
    }

    /// Set up the worker session for `workspace_root`.
    ///
    /// Starts the worker if needed. Returns immediately if the running worker
    /// is already initialized.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`]: the worker could not be started.
    /// - [`AppError::Worker`]: the worker reported an initialization error.
    /// - [`AppError::Timeout`]: no status within `timeouts.initialize_seconds`.
    /// - [`AppError::ProcessExited`]: the worker died before answering.
    /// - [`AppError::Unavailable`]: the command could not be written.
    pub async fn initialize(&self, workspace_root: &Path) -> Result<()> {
        let _turn = self.calls.lock().await;

        let generation = self.supervisor.ensure().await?;
        if self.supervisor.is_initialized().await {
            debug!(generation, "initialize: already initialized, skipping");
            return Ok(());
        }

        let style = self.config.worker.path_style;
        let bundle = &self.config.worker.bundle_path;
        let bundle = if bundle.is_relative() {
            workspace_root.join(bundle)
        } else {
            bundle.clone()
        };
        let command = Command::Initialize {
            workspace_root: translate_path(workspace_root, style),
            bundle_path: translate_path(&bundle, style),
        };

        let deadline = Instant::now() + self.config.timeouts.initialize();
        let mut handle = self.correlator.issue(CallKind::Initialize, deadline).await?;
        self.dispatch(&handle, generation, command, None).await?;

        self.await_outcome(&mut handle, None, &mut |_: &str| {}).await?;
        self.supervisor.mark_initialized(generation).await;
        info!(generation, workspace = %workspace_root.display(), "worker initialized");
        Ok(())
    }

    /// Run one turn, streaming sanitized chunks to `on_chunk` in arrival order.
    ///
    /// Once `cancel` fires the call resolves with [`AppError::Cancelled`] and
    /// no further chunks are delivered. The worker itself keeps running; its
    /// remaining output for the turn is discarded.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotInitialized`]: no successful `initialize` on the
    ///   running worker.
    /// - [`AppError::Worker`]: the worker reported an `error` event.
    /// - [`AppError::Timeout`]: no terminal event within `timeouts.execute_seconds`.
    /// - [`AppError::Cancelled`]: `cancel` fired first.
    /// - [`AppError::ProcessExited`]: the worker died mid-turn.
    /// - [`AppError::Unavailable`]: the command could not be written.
    pub async fn execute<F>(&self, prompt: &str, mut on_chunk: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        let _turn = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            guard = self.calls.lock() => guard,
        };

        let Some(generation) = self.supervisor.initialized_generation().await else {
            return Err(AppError::NotInitialized);
        };

        let deadline = Instant::now() + self.config.timeouts.execute();
        let mut handle = self.correlator.issue(CallKind::Execute, deadline).await?;
        let command = Command::Execute {
            prompt: prompt.to_owned(),
        };
        self.dispatch(&handle, generation, command, Some(cancel)).await?;

        self.await_outcome(&mut handle, Some(cancel), &mut on_chunk).await
    }

    /// Stop the worker and clear all state.
    ///
    /// Sends `shutdown`, waits `timeouts.shutdown_grace_millis`, then
    /// terminates the process. Safe to call repeatedly, including while a
    /// call is pending (that call fails with a process-exited error).
    pub async fn shutdown(&self) {
        self.supervisor
            .shutdown(self.config.timeouts.shutdown_grace())
            .await;
    }

    /// Lifecycle state of the worker.
    pub async fn state(&self) -> WorkerState {
        self.supervisor.state().await
    }

    /// Whether `execute` may be called right now.
    pub async fn is_initialized(&self) -> bool {
        self.supervisor.is_initialized().await
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Write `command` for the call behind `handle` to worker `generation`.
    ///
    /// The write races the call's deadline and `cancel`. A call that gives up
    /// mid-write may have left part of a line on the worker's stdin, so the
    /// worker is retired along with it.
    async fn dispatch(
        &self,
        handle: &CallHandle,
        generation: u64,
        command: Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let name = command.name();
        let reason = tokio::select! {
            biased;

            written = self.supervisor.send(generation, command) => {
                if written.is_err() {
                    // Nothing reached the worker, so nothing will come back for it.
                    self.correlator.withdraw(handle.id()).await;
                }
                return written;
            }

            () = wait_cancelled(cancel) => cancelled(),

            () = tokio::time::sleep_until(handle.deadline()) => {
                let window = self.window(handle.kind());
                AppError::Timeout(format!("`{name}` could not be written within {window:?}"))
            }
        };

        warn!(call_id = handle.id(), generation, %reason, "command write abandoned");
        self.correlator.cancel(handle.id(), &reason.to_string()).await;
        self.supervisor
            .retire(generation, &format!("`{name}` write abandoned: {reason}"))
            .await;
        Err(reason)
    }

    /// Drive `handle` to its terminal outcome, the deadline, or `cancel`.
    async fn await_outcome(
        &self,
        handle: &mut CallHandle,
        cancel: Option<&CancellationToken>,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        let deadline = handle.deadline();
        let window = self.window(handle.kind());
        let name = match handle.kind() {
            CallKind::Initialize => "initialize",
            CallKind::Execute => "execute",
        };

        loop {
            let event = tokio::select! {
                biased;

                () = wait_cancelled(cancel) => {
                    return self.abandon(handle, cancelled()).await;
                }

                () = tokio::time::sleep_until(deadline) => {
                    let err = AppError::Timeout(format!("{name} did not finish within {window:?}"));
                    warn!(call_id = handle.id(), %err, "call timed out");
                    return self.abandon(handle, err).await;
                }

                event = handle.next() => event,
            };

            match event {
                Some(CallEvent::Chunk(raw)) => {
                    let clean = self.sanitizer.sanitize(&raw);
                    if !clean.is_empty() {
                        on_chunk(&clean);
                    }
                }
                Some(CallEvent::Completed) => return Ok(()),
                Some(CallEvent::Failed(err)) => return Err(err),
                None => return Err(AppError::ProcessExited("call dropped by correlator".into())),
            }
        }
    }

    fn window(&self, kind: CallKind) -> std::time::Duration {
        match kind {
            CallKind::Initialize => self.config.timeouts.initialize(),
            CallKind::Execute => self.config.timeouts.execute(),
        }
    }

    /// Release the slot with `reason`; if a terminal event won the race, report it.
    async fn abandon(&self, handle: &mut CallHandle, reason: AppError) -> Result<()> {
        if self.correlator.cancel(handle.id(), &reason.to_string()).await {
            return Err(reason);
        }

        // Already resolved: the outcome is queued on the handle. Chunks that
        // arrived before it are not delivered after the caller gave up.
        loop {
            match handle.next().await {
                Some(CallEvent::Chunk(_)) => {}
                Some(CallEvent::Completed) => return Ok(()),
                Some(CallEvent::Failed(err)) => return Err(err),
                None => return Err(reason),
            }
        }
    }
}

fn cancelled() -> AppError {
    AppError::Cancelled("operation cancelled by caller".into())
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
