//! NDJSON codec for the worker's stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum line length
//! and layers JSON parsing on top. Framing is purely line based: the way the
//! pipe happens to chunk bytes never changes which messages come out, only
//! `\n` boundaries do.
//!
//! Malformed input is never fatal. A line that is not a JSON object, is not
//! valid UTF-8, or exceeds [`MAX_LINE_BYTES`] is logged at `WARN` and skipped;
//! decoding resumes at the next line.
//!
//! # Usage
//!
//! Use [`WireCodec`] with [`tokio_util::codec::FramedRead`] over the worker's
//! stdout and [`tokio_util::codec::FramedWrite`] over its stdin, or drive a
//! [`DecodeBuffer`] by hand when bytes arrive from elsewhere.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::wire::protocol::{Command, WorkerMessage};
use crate::{AppError, Result};

/// Maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line-framed JSON codec: [`Command`] out, [`WorkerMessage`] in.
#[derive(Debug)]
pub struct WireCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
    malformed: u64,
}

impl WireCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(max: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max),
            max_line_bytes: max,
            malformed: 0,
        }
    }

    /// Number of inbound lines skipped as malformed so far.
    #[must_use]
    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    /// Turn one framed line into a message, or `None` if it must be skipped.
    fn parse_line(&mut self, line: &str) -> Option<WorkerMessage> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => Some(WorkerMessage::from_value(value)),
            Ok(_) => {
                self.malformed += 1;
                warn!(raw_line = trimmed, "wire: non-object JSON line, skipping");
                None
            }
            Err(err) => {
                self.malformed += 1;
                warn!(error = %err, raw_line = trimmed, "wire: malformed json line, skipping");
                None
            }
        }
    }

    /// Absorb a recoverable framing error, or surface an unrecoverable one.
    fn absorb(&mut self, err: LinesCodecError) -> Result<()> {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                self.malformed += 1;
                warn!(limit = self.max_line_bytes, "wire: line too long, discarding until next newline");
                Ok(())
            }
            LinesCodecError::Io(io_err) if io_err.kind() == std::io::ErrorKind::InvalidData => {
                self.malformed += 1;
                warn!(error = %io_err, "wire: line is not valid utf-8, skipping");
                Ok(())
            }
            LinesCodecError::Io(io_err) => Err(AppError::Io(io_err.to_string())),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = WorkerMessage;
    type Error = AppError;

    /// Decode the next message from `src`, skipping malformed lines.
    ///
    /// Returns `Ok(None)` when `src` holds no further complete line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    if let Some(msg) = self.parse_line(&line) {
                        return Ok(Some(msg));
                    }
                }
                Ok(None) => return Ok(None),
                Err(err) => self.absorb(err)?,
            }
        }
    }

    /// Decode at EOF, treating an unterminated final line as complete.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(msg) = self.parse_line(&line) {
                        return Ok(Some(msg));
                    }
                }
                Ok(None) => return Ok(None),
                Err(err) => self.absorb(err)?,
            }
        }
    }
}

impl Encoder<Command> for WireCodec {
    type Error = AppError;

    /// Encode `item` as one `\n`-terminated JSON line.
    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let line = encode_command(&item)?;
        dst.extend_from_slice(&line);
        Ok(())
    }
}

/// Serialise a command to a single JSON line terminated by `\n`.
///
/// Newlines inside string fields are escaped by `serde_json`, so the output
/// contains exactly one `\n`, at the end.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialisation fails.
pub fn encode_command(command: &Command) -> Result<Bytes> {
    let mut bytes = serde_json::to_vec(command)
        .map_err(|e| AppError::Protocol(format!("failed to serialise command: {e}")))?;
    bytes.push(b'\n');
    Ok(Bytes::from(bytes))
}

/// Incremental decoder for byte chunks that do not arrive through a reader.
///
/// Holds the incomplete trailing line between calls to [`DecodeBuffer::feed`].
#[derive(Debug, Default)]
pub struct DecodeBuffer {
    codec: WireCodec,
    tail: BytesMut,
}

impl DecodeBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and lazily yield every message completed by it.
    ///
    /// Lines left undrained when the iterator is dropped stay buffered and
    /// come out of the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Decoded<'_> {
        self.tail.extend_from_slice(chunk);
        Decoded { buffer: self }
    }

    /// Flush the buffered tail as a final line (end of stream).
    pub fn finish(&mut self) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        loop {
            match self.codec.decode_eof(&mut self.tail) {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "wire: decode error at end of stream");
                    break;
                }
            }
        }
        out
    }

    /// Bytes of the incomplete trailing line.
    #[must_use]
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// Number of lines skipped as malformed so far.
    #[must_use]
    pub fn malformed_lines(&self) -> u64 {
        self.codec.malformed_lines()
    }
}

/// Lazy iterator returned by [`DecodeBuffer::feed`].
#[derive(Debug)]
pub struct Decoded<'a> {
    buffer: &'a mut DecodeBuffer,
}

impl Iterator for Decoded<'_> {
    type Item = WorkerMessage;

    fn next(&mut self) -> Option<Self::Item> {
        let DecodeBuffer { codec, tail } = &mut *self.buffer;
        match codec.decode(tail) {
            Ok(item) => item,
            Err(err) => {
                warn!(error = %err, "wire: decode error, stopping batch");
                None
            }
        }
    }
}
