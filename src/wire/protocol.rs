//! Wire message types exchanged with the worker.
//!
//! | Direction        | Shape                                              |
//! |------------------|----------------------------------------------------|
//! | bridge → worker  | `{"command": "initialize" \| "execute" \| "shutdown", …}` |
//! | worker → bridge  | `{"status": "initialized" \| "error" \| "shutdown", …}`   |
//! | worker → bridge  | `{"type": "response" \| "error" \| "done", …}`            |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Command written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Set up the session context.
    Initialize {
        /// Workspace root, already translated for the worker's namespace.
        workspace_root: String,
        /// Configuration bundle location, already translated.
        bundle_path: String,
    },
    /// Run one turn on the active session.
    Execute {
        /// Prompt text; newlines travel escaped inside the JSON string.
        prompt: String,
    },
    /// Request graceful termination.
    Shutdown,
}

impl Command {
    /// Short name used in log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Execute { .. } => "execute",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Value of the `status` field in a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Session set up successfully.
    Initialized,
    /// Initialization failed; see `error`.
    Error,
    /// Acknowledgement of a `shutdown` command.
    Shutdown,
}

/// Status report answering `initialize` or `shutdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Outcome of the command.
    pub status: WorkerStatus,
    /// Error text when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Workspace root echoed back by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    /// Bundle file echoed back by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
}

/// Event emitted while an `execute` turn runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Partial content chunk.
    Response {
        /// Raw text, unsanitized.
        #[serde(default)]
        content: String,
    },
    /// Terminal failure.
    Error {
        /// Error text reported by the worker.
        #[serde(default)]
        error: Option<String>,
    },
    /// Terminal success; closes the turn.
    Done,
}

impl ExecutionEvent {
    /// Whether this event ends the caller's interest in the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Response { .. })
    }
}

/// A decoded line from the worker's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// `{"status": …}` report.
    Status(StatusReport),
    /// `{"type": …}` execution event.
    Event(ExecutionEvent),
    /// Valid JSON that matches neither shape.
    Unrecognized(Value),
}

impl WorkerMessage {
    /// Classify an already-parsed JSON value.
    ///
    /// Objects carrying a `type` field are execution events; objects carrying
    /// `status` are status reports. Anything else, including a known key with
    /// an unknown value, is [`WorkerMessage::Unrecognized`].
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let is_event = value.get("type").is_some();
        let is_status = value.get("status").is_some();

        if is_event {
            match serde_json::from_value::<ExecutionEvent>(value.clone()) {
                Ok(event) => return Self::Event(event),
                Err(err) => debug!(error = %err, "wire: `type` field present but not an execution event"),
            }
        } else if is_status {
            match serde_json::from_value::<StatusReport>(value.clone()) {
                Ok(report) => return Self::Status(report),
                Err(err) => debug!(error = %err, "wire: `status` field present but not a status report"),
            }
        }

        Self::Unrecognized(value)
    }
}
