//! Single-slot request correlator.
//!
//! The worker protocol carries no request ids: the worker answers commands
//! strictly in order, one at a time. The correlator therefore holds exactly
//! one pending call and routes every decoded [`WorkerMessage`] to it.
//!
//! # Call lifecycle
//!
//! 1. [`Correlator::issue`] occupies the slot and returns a [`CallHandle`].
//! 2. The reader task calls [`Correlator::route`] for each decoded message;
//!    chunks and the terminal outcome arrive on the handle as [`CallEvent`]s.
//! 3. The slot is cleared by whichever comes first: a terminal message,
//!    [`Correlator::cancel`] (timeout or user cancellation), or
//!    [`Correlator::worker_gone`]. Later events for the same call are ignored.
//!
//! # Turn ledger
//!
//! A call that is abandoned before the worker finished answering leaves
//! output in flight. The ledger counts such abandoned turns and discards
//! their messages until each one's closing message (`done` for an execute
//! turn, the status report for an initialize) has gone by, so stale output
//! can never be attributed to the next call.
//!
//! An execute `error` is terminal on its own, though some workers still
//! close the turn with `done`. A `done` that immediately follows an error is
//! taken as that closing message and dropped; anything else ends the wait.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::wire::protocol::{ExecutionEvent, StatusReport, WorkerMessage, WorkerStatus};
use crate::{AppError, Result};

/// Identifier of one logical call.
pub type CallId = u64;

/// Which command a pending call is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Waiting for a status report.
    Initialize,
    /// Waiting for zero or more chunks and a terminal event.
    Execute,
}

/// Outcome delivered to a [`CallHandle`].
#[derive(Debug)]
pub enum CallEvent {
    /// Partial content for an execute call, unsanitized.
    Chunk(String),
    /// Terminal success: `initialized` or `done`.
    Completed,
    /// Terminal failure: worker error, process exit, cancellation, timeout.
    Failed(AppError),
}

/// Caller-side end of a pending call.
#[derive(Debug)]
pub struct CallHandle {
    id: CallId,
    kind: CallKind,
    deadline: Instant,
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallHandle {
    /// Identifier used with [`Correlator::cancel`].
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Kind of the call.
    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Wall-clock deadline fixed at issuance.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the next event. `None` means the correlator dropped the call.
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }
}

/// Correlator-side record of the call in flight.
#[derive(Debug)]
struct PendingCall {
    id: CallId,
    kind: CallKind,
    tx: mpsc::UnboundedSender<CallEvent>,
}

/// Abandoned turns whose output is still on its way.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Ledger {
    /// Execute turns still owed a closing `done`.
    stale_turns: u32,
    /// Initialize calls still owed a status report.
    stale_reports: u32,
    /// The last execute event was an `error`; a `done` right after it closes that turn.
    after_error: bool,
}

impl Ledger {
    fn abandon(&mut self, kind: CallKind) {
        match kind {
            CallKind::Execute => self.stale_turns += 1,
            CallKind::Initialize => self.stale_reports += 1,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pending: Option<PendingCall>,
    ledger: Ledger,
}

/// Single-slot registry routing worker messages to the pending call.
#[derive(Debug, Default)]
pub struct Correlator {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Correlator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call in the single pending slot.
    ///
    /// A pending call whose handle has been dropped is treated as abandoned
    /// and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if another live call is pending. The
    /// bridge serialises calls, so this indicates a caller bug.
    pub async fn issue(&self, kind: CallKind, deadline: Instant) -> Result<CallHandle> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.pending.take() {
            if existing.tx.is_closed() {
                debug!(call_id = existing.id, "correlator: replacing abandoned call");
                state.ledger.abandon(existing.kind);
            } else {
                let busy = existing.id;
                state.pending = Some(existing);
                return Err(AppError::Protocol(format!(
                    "call {busy} is still pending; calls must be serialised"
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.pending = Some(PendingCall { id, kind, tx });
        debug!(call_id = id, ?kind, "correlator: call issued");

        Ok(CallHandle {
            id,
            kind,
            deadline,
            rx,
        })
    }

    /// Deliver a decoded message to the pending call, if it belongs to it.
    pub async fn route(&self, msg: WorkerMessage) {
        let mut state = self.state.lock().await;
        match msg {
            WorkerMessage::Event(event) => route_event(&mut state, event),
            WorkerMessage::Status(report) => route_status(&mut state, report),
            WorkerMessage::Unrecognized(value) => {
                debug!(raw = %value, "correlator: unrecognized message, discarding");
            }
        }
    }

    /// Clear the slot for call `id` and fail it as cancelled with `reason`.
    ///
    /// The worker may still be answering, so the turn is recorded in the
    /// ledger. Returns `false` if the call had already been resolved; the
    /// first resolution wins.
    pub async fn cancel(&self, id: CallId, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let owns_slot = state.pending.as_ref().is_some_and(|p| p.id == id);
        if !owns_slot {
            return false;
        }

        if let Some(call) = state.pending.take() {
            state.ledger.abandon(call.kind);
            debug!(call_id = id, reason, "correlator: call cancelled");
            // The handle may already be gone; nothing to report then.
            let _ = call
                .tx
                .send(CallEvent::Failed(AppError::Cancelled(reason.to_owned())));
        }
        true
    }

    /// Clear the slot for a call whose command never reached the worker.
    ///
    /// Unlike [`Correlator::cancel`] nothing is owed by the worker, so the
    /// ledger is left alone.
    pub async fn withdraw(&self, id: CallId) {
        let mut state = self.state.lock().await;
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
            debug!(call_id = id, "correlator: call withdrawn before reaching the worker");
        }
    }

    /// The worker process is gone: fail any pending call and forget the ledger.
    ///
    /// Returns `true` if a call was pending.
    pub async fn worker_gone(&self, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        state.ledger = Ledger::default();

        let Some(call) = state.pending.take() else {
            return false;
        };
        warn!(call_id = call.id, reason, "correlator: worker exited with a call pending");
        let _ = call
            .tx
            .send(CallEvent::Failed(AppError::ProcessExited(reason.to_owned())));
        true
    }

    /// Kind of the call currently holding the slot, if any.
    pub async fn pending_kind(&self) -> Option<CallKind> {
        self.state.lock().await.pending.as_ref().map(|p| p.kind)
    }

    /// Whether the slot is free.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.pending.is_none()
    }
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// Send `event` to the pending call; an unreachable handle abandons the call.
fn deliver(state: &mut State, event: CallEvent, terminal: bool) {
    let Some(call) = state.pending.as_ref() else {
        return;
    };

    let delivered = call.tx.send(event).is_ok();
    if terminal {
        state.pending = None;
    } else if !delivered {
        if let Some(call) = state.pending.take() {
            debug!(call_id = call.id, "correlator: handle dropped mid-call, abandoning");
            state.ledger.abandon(call.kind);
        }
    }
}

fn route_event(state: &mut State, event: ExecutionEvent) {
    if std::mem::take(&mut state.ledger.after_error) && event == ExecutionEvent::Done {
        debug!("correlator: `done` closing a failed turn, discarding");
        return;
    }

    if state.ledger.stale_turns > 0 {
        match event {
            ExecutionEvent::Done => state.ledger.stale_turns -= 1,
            ExecutionEvent::Error { .. } => {
                state.ledger.stale_turns -= 1;
                state.ledger.after_error = true;
            }
            ExecutionEvent::Response { .. } => {}
        }
        debug!(?event, "correlator: output of an abandoned turn, discarding");
        return;
    }

    let Some(kind) = state.pending.as_ref().map(|p| p.kind) else {
        warn!(?event, "correlator: event with no pending call, discarding");
        return;
    };

    match (kind, event) {
        (CallKind::Execute, ExecutionEvent::Response { content }) => {
            deliver(state, CallEvent::Chunk(content), false);
        }
        (CallKind::Execute, ExecutionEvent::Done) => {
            deliver(state, CallEvent::Completed, true);
        }
        (CallKind::Execute, ExecutionEvent::Error { error }) => {
            let text = error.unwrap_or_else(|| "execution failed".to_owned());
            deliver(state, CallEvent::Failed(AppError::Worker(text)), true);
            state.ledger.after_error = true;
        }
        (CallKind::Initialize, ExecutionEvent::Error { error }) => {
            // Rejected command line (bad JSON, unknown command); no `done` follows.
            let text = error.unwrap_or_else(|| "initialization failed".to_owned());
            deliver(state, CallEvent::Failed(AppError::Worker(text)), true);
        }
        (CallKind::Initialize, event) => {
            warn!(?event, "correlator: execution event during initialize, discarding");
        }
    }
}

fn route_status(state: &mut State, report: StatusReport) {
    if report.status == WorkerStatus::Shutdown {
        debug!("correlator: worker acknowledged shutdown");
        return;
    }

    if state.ledger.stale_reports > 0 {
        state.ledger.stale_reports -= 1;
        debug!(status = ?report.status, "correlator: report for an abandoned initialize, discarding");
        return;
    }

    let awaiting_report = state
        .pending
        .as_ref()
        .is_some_and(|p| p.kind == CallKind::Initialize);
    if !awaiting_report {
        warn!(status = ?report.status, "correlator: status report with no pending initialize, discarding");
        return;
    }

    let event = match report.status {
        WorkerStatus::Initialized => CallEvent::Completed,
        WorkerStatus::Error | WorkerStatus::Shutdown => {
            let text = report
                .error
                .unwrap_or_else(|| "initialization failed".to_owned());
            CallEvent::Failed(AppError::Worker(text))
        }
    };
    deliver(state, event, true);
}
