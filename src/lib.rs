#![forbid(unsafe_code)]

//! Persistent subprocess bridge.
//!
//! Supervises one long-running worker process, speaks newline-delimited JSON
//! over its stdio, correlates each `initialize`/`execute` call with the
//! worker's replies, and streams sanitized output back to the caller.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod sanitize;
pub mod wire;
pub mod worker;

pub use bridge::WorkerBridge;
pub use config::BridgeConfig;
pub use errors::{AppError, Result};
