//! Line framing for control and data sockets: one JSON document per `\n`
//! terminated line, optionally followed by raw payload bytes whose length
//! the header declares.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("header line is {size} bytes, limit is {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("cannot encode header: {0}")]
    Encode(String),
    #[error("cannot decode header: {0}")]
    Decode(String),
    #[error("socket error: {0}")]
    Io(String),
    #[error("stream closed after {read} of {expected} payload bytes")]
    TruncatedPayload { read: usize, expected: u64 },
    #[error("header declares a {declared} byte payload, limit is {max}")]
    OversizedPayload { declared: u64, max: u64 },
}

impl FrameError {
    /// A bad line can be skipped; anything else leaves the stream unusable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::Decode(_) | FrameError::OversizedFrame { .. }
        )
    }
}

fn check_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::OversizedFrame { size, max });
    }
    Ok(())
}

/// Serializes `value` as a single newline-terminated line.
pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut line =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    check_size(line.len(), max_frame_bytes)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_frame<T: DeserializeOwned>(
    line: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let body = trim_line(line);
    check_size(body.len(), max_frame_bytes)?;
    serde_json::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Drops the line terminator (`\n` or `\r\n`).
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
