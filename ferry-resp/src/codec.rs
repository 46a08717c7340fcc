//! Incremental RESP decoding.
//!
//! `decode_value` and `decode_command` operate on the session's read buffer:
//! they consume nothing until a complete value is present, so the caller can
//! simply append socket reads and retry.

use bytes::{Buf, Bytes, BytesMut};

use crate::command::Command;
use crate::error::{RespError, RespResult};
use crate::value::RespValue;

/// Maximum size of a single bulk string (64 MB).
pub const MAX_BULK_BYTES: usize = 64 * 1024 * 1024;

/// Maximum number of elements in an array.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum array nesting depth.
pub const MAX_DEPTH: usize = 32;

/// Decodes one complete value from the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete value; the
/// buffer is only advanced when a value is returned.
///
/// # Errors
///
/// Returns an error if the buffered bytes violate the protocol or exceed
/// size limits.
pub fn decode_value(buf: &mut BytesMut) -> RespResult<Option<RespValue>> {
    match parse_value(&buf[..], 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decodes one complete client command from the front of `buf`.
///
/// A command is an array of bulk strings. The returned [`Command`] keeps the
/// raw frame bytes so it can be forwarded to a backend verbatim.
///
/// # Errors
///
/// Returns an error if the frame is not an array of bulk strings or violates
/// the protocol.
pub fn decode_command(buf: &mut BytesMut) -> RespResult<Option<Command>> {
    let Some((value, consumed)) = parse_value(&buf[..], 0)? else {
        return Ok(None);
    };
    let raw = buf.split_to(consumed).freeze();

    let RespValue::Array(items) = value else {
        return Err(RespError::syntax("command must be an array of bulk strings"));
    };
    if items.is_empty() {
        return Err(RespError::syntax("empty command"));
    }

    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::Bulk(arg) => args.push(arg),
            _ => return Err(RespError::syntax("command arguments must be bulk strings")),
        }
    }

    Ok(Some(Command::from_parts(raw, args)))
}

/// Parses one value from `data` without consuming.
///
/// Returns the value and the number of bytes it occupies, or `None` if the
/// data is incomplete.
fn parse_value(data: &[u8], depth: usize) -> RespResult<Option<(RespValue, usize)>> {
    if depth > MAX_DEPTH {
        return Err(RespError::DepthExceeded { max: MAX_DEPTH });
    }
    if data.is_empty() {
        return Ok(None);
    }

    let Some(line_end) = find_crlf(data) else {
        return Ok(None);
    };
    if line_end == 0 {
        return Err(RespError::syntax("missing type byte"));
    }
    let line = &data[1..line_end];
    let header_len = line_end + 2;

    match data[0] {
        b'+' => Ok(Some((RespValue::Simple(line_to_string(line)?), header_len))),
        b'-' => Ok(Some((RespValue::Error(line_to_string(line)?), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => parse_bulk(data, line, header_len),
        b'*' => parse_array(data, line, header_len, depth),
        other => Err(RespError::syntax(format!(
            "unexpected type byte 0x{other:02x}"
        ))),
    }
}

fn parse_bulk(data: &[u8], line: &[u8], header_len: usize) -> RespResult<Option<(RespValue, usize)>> {
    let declared = parse_int(line)?;
    if declared == -1 {
        return Ok(Some((RespValue::NullBulk, header_len)));
    }
    let Ok(len) = usize::try_from(declared) else {
        return Err(RespError::syntax("negative bulk length"));
    };
    if len > MAX_BULK_BYTES {
        return Err(RespError::BulkTooLarge {
            size: len,
            max: MAX_BULK_BYTES,
        });
    }

    let total = header_len + len + 2;
    if data.len() < total {
        return Ok(None);
    }
    if &data[header_len + len..total] != b"\r\n" {
        return Err(RespError::syntax("bulk string not terminated by CRLF"));
    }

    let payload = Bytes::copy_from_slice(&data[header_len..header_len + len]);
    Ok(Some((RespValue::Bulk(payload), total)))
}

fn parse_array(
    data: &[u8],
    line: &[u8],
    header_len: usize,
    depth: usize,
) -> RespResult<Option<(RespValue, usize)>> {
    let declared = parse_int(line)?;
    if declared == -1 {
        return Ok(Some((RespValue::NullArray, header_len)));
    }
    let Ok(len) = usize::try_from(declared) else {
        return Err(RespError::syntax("negative array length"));
    };
    if len > MAX_ARRAY_LEN {
        return Err(RespError::ArrayTooLong {
            len,
            max: MAX_ARRAY_LEN,
        });
    }

    let mut items = Vec::with_capacity(len.min(64));
    let mut offset = header_len;
    for _ in 0..len {
        match parse_value(&data[offset..], depth + 1)? {
            Some((item, used)) => {
                items.push(item);
                offset += used;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), offset)))
}

/// Finds the position of the first `\r\n`, returning the index of the `\r`.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}

fn line_to_string(line: &[u8]) -> RespResult<String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| RespError::syntax("line is not valid UTF-8"))
}

fn parse_int(line: &[u8]) -> RespResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespError::syntax("invalid integer"))
}
