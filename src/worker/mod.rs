//! Worker subprocess management.
//!
//! - `spawner`: process launch with environment isolation, plus the cheap
//!   interpreter availability probe.
//! - `reader`: stdout protocol reader and stderr diagnostics drain.
//! - `supervisor`: lifecycle state machine owning the single worker.
//! - `path`: caller → worker filesystem path translation.

pub mod path;
pub mod reader;
pub mod spawner;
pub mod supervisor;
