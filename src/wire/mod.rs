//! Newline-delimited JSON wire format spoken with the worker.
//!
//! - `protocol`: command and event types for both directions.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing
//!   with malformed-line recovery, plus a hand-fed [`codec::DecodeBuffer`].

pub mod codec;
pub mod protocol;
