//! Worker stream reader tasks.
//!
//! [`run_reader`] drives a [`FramedRead`] over the worker's stdout using
//! [`WireCodec`] and hands every decoded message to the [`Correlator`] in
//! stream order, which is what keeps execute chunks in emission order.
//!
//! [`drain_stderr`] consumes the worker's stderr line by line. Those lines
//! are diagnostics only: they are logged and remembered for exit reports,
//! never parsed as protocol data.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::wire::codec::WireCodec;

/// Number of stderr lines kept for exit diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

/// Why the stdout reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The worker closed stdout.
    Eof,
    /// Reading failed; the stream is unusable.
    Failed(String),
    /// The reader was told to stop.
    Cancelled,
}

/// Read protocol messages from `stdout` until EOF, error, or cancellation.
///
/// Malformed lines are absorbed by the codec and never end the task.
pub async fn run_reader<R>(
    generation: u64,
    stdout: R,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(generation, "worker reader: cancellation received, stopping");
                return StreamEnd::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(generation, "worker reader: EOF detected");
                        return StreamEnd::Eof;
                    }
                    Some(Err(e)) => {
                        warn!(generation, error = %e, "worker reader: IO error, stopping");
                        return StreamEnd::Failed(e.to_string());
                    }
                    Some(Ok(msg)) => correlator.route(msg).await,
                }
            }
        }
    }
}

/// Rolling window of the most recent stderr lines.
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    /// Record a line, evicting the oldest beyond [`STDERR_TAIL_LINES`].
    pub async fn push(&self, line: String) {
        let mut lines = self.0.lock().await;
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent line, if any.
    pub async fn last(&self) -> Option<String> {
        self.0.lock().await.back().cloned()
    }
}

/// Log every stderr line at `DEBUG` and keep the latest ones in `tail`.
pub async fn drain_stderr<R>(generation: u64, stderr: R, tail: StderrTail, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    // Split on raw bytes so non-UTF-8 output cannot stall the drain.
    let mut segments = BufReader::new(stderr).split(b'\n');

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            segment = segments.next_segment() => {
                match segment {
                    Ok(Some(bytes)) => {
                        let line = String::from_utf8_lossy(&bytes).trim_end().to_owned();
                        if line.trim().is_empty() {
                            continue;
                        }
                        debug!(
                            target: "worker_bridge::worker::stderr",
                            generation,
                            line = line.as_str(),
                            "worker stderr"
                        );
                        tail.push(line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(generation, error = %e, "worker stderr: read failed, stopping");
                        break;
                    }
                }
            }
        }
    }
}
