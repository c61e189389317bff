//! Wire framing shared by the server and the connector.
//!
//! Every request and response is one length-prefixed text frame:
//!
//! ```text
//! Frame:   <length>\r\n<payload of exactly length bytes>
//!
//! Example:
//! Request:  17\r\nSELECT version();
//! Response: 12\r\nSimpleDB 1.0
//! ```
//!
//! The length is the decimal byte count of the UTF-8 payload. A frame is
//! only handed to the caller once the whole payload has been buffered, so
//! payloads that arrive over several reads are reassembled.

use crate::error::FrameError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum request payload, in bytes.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024;

/// Default maximum response payload accepted by the connector, in bytes.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Longest accepted length header (digits only, excluding `\r\n`).
const MAX_HEADER_DIGITS: usize = 20;

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A complete frame is buffered.
    Complete {
        /// Bytes consumed by the header (length + \r\n).
        header_len: usize,
        /// Payload length.
        length: usize,
    },
    /// Need more data.
    Incomplete,
    /// Header is not a decimal length.
    InvalidLength,
    /// Declared payload exceeds the limit.
    TooLarge(usize),
}

/// Parse one frame from the front of `input`.
pub fn parse(input: &[u8], max_payload: usize) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_DIGITS + 1 => return ParseResult::InvalidLength,
        None if !input.iter().all(u8::is_ascii_digit) => {
            // A stray '\r' may still be waiting for its '\n'.
            let digits = input.strip_suffix(b"\r").unwrap_or(input);
            if digits.iter().all(u8::is_ascii_digit) {
                return ParseResult::Incomplete;
            }
            return ParseResult::InvalidLength;
        }
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    if line.is_empty() || line.len() > MAX_HEADER_DIGITS || !line.iter().all(u8::is_ascii_digit)
    {
        return ParseResult::InvalidLength;
    }

    // All ASCII digits, so from_utf8 cannot fail; parse can still overflow.
    let length: usize = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };

    if length > max_payload {
        return ParseResult::TooLarge(length);
    }

    let header_len = line_end + 2;
    if input.len() < header_len + length {
        return ParseResult::Incomplete;
    }

    ParseResult::Complete { header_len, length }
}

/// Append a frame carrying `payload` to `output`.
pub fn encode(payload: &[u8], output: &mut BytesMut) {
    let header = format!("{}\r\n", payload.len());
    output.reserve(header.len() + payload.len());
    output.extend_from_slice(header.as_bytes());
    output.extend_from_slice(payload);
}

/// Read one frame from `reader`, buffering in `buffer`.
///
/// Returns `Ok(None)` when the peer closes the stream cleanly between
/// frames. Bytes beyond the returned frame stay in `buffer`.
pub async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match parse(buffer, max_payload) {
            ParseResult::Complete { header_len, length } => {
                buffer.advance(header_len);
                return Ok(Some(buffer.split_to(length).freeze()));
            }
            ParseResult::InvalidLength => return Err(FrameError::InvalidLength),
            ParseResult::TooLarge(length) => {
                return Err(FrameError::TooLarge {
                    length,
                    max: max_payload,
                })
            }
            ParseResult::Incomplete => {}
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::UnexpectedEof)
            };
        }
    }
}

/// Write `payload` as a single frame and flush.
///
/// `write_all` keeps writing until the whole frame is out, so a short write
/// never truncates a response.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::new();
    encode(payload, &mut frame);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
