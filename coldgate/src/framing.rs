//! Request framing for the device protocol.
//!
//! A request is one JSON object. The end of the message is detected when the
//! bytes received so far, decoded as UTF-8 with invalid sequences dropped,
//! end with `}`. There is no length prefix. A string field containing a
//! literal `}` at a read boundary truncates the message early; this is the
//! deployed wire behaviour and should be replaced by length-prefixed framing
//! in the next protocol revision rather than extended.

use crate::error::{ProtocolError, TransportError};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 1024;

/// Decode UTF-8, silently skipping byte sequences that are not valid.
pub fn decode_lossy_ignore(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // `valid_up_to` guarantees this prefix is UTF-8.
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(len) => rest = &after[len..],
                    // Truncated sequence at the end of the buffer.
                    None => return out,
                }
            }
        }
    }
}

/// Whether the buffer holds a complete message under the trailing-brace rule.
pub fn is_complete(buf: &[u8]) -> bool {
    decode_lossy_ignore(buf).ends_with('}')
}

/// Read one request from `stream`.
///
/// Each read waits at most `idle_timeout`. End of stream, a timeout, or a
/// read error before the terminating brace ends the session silently.
pub async fn read_message<S>(
    stream: &mut S,
    idle_timeout: Duration,
    max_bytes: usize,
) -> Result<Vec<u8>, ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match tokio::time::timeout(idle_timeout, stream.read(&mut chunk)).await {
            Err(_) => return Err(TransportError::IdleTimeout(idle_timeout).into()),
            Ok(Err(e)) => return Err(TransportError::Read(e).into()),
            Ok(Ok(0)) => return Err(TransportError::Closed.into()),
            Ok(Ok(n)) => n,
        };

        buf.extend_from_slice(&chunk[..n]);

        if is_complete(&buf) {
            return Ok(buf);
        }
        if buf.len() > max_bytes {
            return Err(ProtocolError::MessageTooLarge { limit: max_bytes }.into());
        }
    }
}

/// Decode a complete request into a JSON object.
pub fn decode_message(buf: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    let text = decode_lossy_ignore(buf);
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Failure while reading a request.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ReadError> for crate::error::SessionError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Transport(t) => t.into(),
            ReadError::Protocol(p) => p.into(),
        }
    }
}
