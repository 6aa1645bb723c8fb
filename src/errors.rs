//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering every failure a caller can observe.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Worker interpreter or script could not be launched.
    Spawn(String),
    /// No running worker to write to ("bridge not available").
    Unavailable(String),
    /// `execute` was called before a successful `initialize`.
    NotInitialized,
    /// No terminal message arrived before the operation deadline.
    Timeout(String),
    /// Error text reported by the worker itself, carried verbatim.
    Worker(String),
    /// The caller cancelled the operation.
    Cancelled(String),
    /// The worker process exited while a call was pending.
    ProcessExited(String),
    /// Wire-level framing or correlation failure.
    Protocol(String),
    /// File-system or pipe I/O failure.
    Io(String),
}

impl AppError {
    /// Whether the error is a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether the error came from a caller-triggered cancellation.
    ///
    /// Cancellations are not failures for retry or backoff purposes.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether the error text originated from the worker rather than the transport.
    #[must_use]
    pub fn is_worker_error(&self) -> bool {
        matches!(self, Self::Worker(_))
    }

    /// The worker's own message for [`AppError::Worker`], `None` otherwise.
    #[must_use]
    pub fn worker_message(&self) -> Option<&str> {
        match self {
            Self::Worker(msg) => Some(msg),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Unavailable(msg) => write!(f, "bridge not available: {msg}"),
            Self::NotInitialized => write!(f, "not initialized: call initialize first"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Worker(msg) => write!(f, "worker: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ProcessExited(msg) => write!(f, "process exited: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
