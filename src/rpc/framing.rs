//! Line framing for JSON-RPC messages.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum message size
//! so an unterminated or oversized line from a misbehaving peer cannot
//! exhaust memory. One newline-terminated UTF-8 line carries exactly one
//! JSON-RPC message.
//!
//! The decoder strips a trailing CR, skips blank lines, and fails on lines
//! past the cap. The encoder refuses empty payloads, payloads containing a
//! newline, and payloads past the cap, then appends a single `\n`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum size of a single framed message: 1 MiB.
pub const MAX_MESSAGE_BYTES: usize = 1_048_576;

/// Newline-delimited codec for JSON-RPC message streams.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a codec enforcing [`MAX_MESSAGE_BYTES`] on the inbound stream.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next non-blank line from `src`.
    ///
    /// Blank and whitespace-only lines are consumed and skipped. Returns
    /// `Ok(None)` when no complete line is buffered yet.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when a line exceeds
    /// [`MAX_MESSAGE_BYTES`], or [`AppError::Io`] on stream failure.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while let Some(line) = self.0.decode(src).map_err(map_codec_error)? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Decode a final unterminated line once the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while let Some(line) = self.0.decode_eof(src).map_err(map_codec_error)? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    /// Encode `payload` as `payload + "\n"` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the payload is empty, contains an
    /// embedded newline, or exceeds [`MAX_MESSAGE_BYTES`].
    fn encode(&mut self, payload: String, dst: &mut BytesMut) -> Result<()> {
        if payload.is_empty() {
            return Err(AppError::Transport("message is empty".into()));
        }
        if payload.contains('\n') {
            return Err(AppError::Transport(
                "message contains embedded newline".into(),
            ));
        }
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(AppError::Transport(format!(
                "message length {} exceeds maximum {MAX_MESSAGE_BYTES}",
                payload.len()
            )));
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(payload.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Transport(format!(
            "message length exceeds maximum {MAX_MESSAGE_BYTES}"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
