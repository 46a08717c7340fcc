//! RESP values and their encoding.

use bytes::{BufMut, Bytes, BytesMut};

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string, e.g. `+OK`.
    Simple(String),
    /// Error reply, e.g. `-ERR unknown command`.
    Error(String),
    /// Integer reply, e.g. `:42`.
    Integer(i64),
    /// Bulk string.
    Bulk(Bytes),
    /// Null bulk string (`$-1`).
    NullBulk,
    /// Array of values.
    Array(Vec<RespValue>),
    /// Null array (`*-1`).
    NullArray,
}

impl RespValue {
    /// The `+OK` reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::Simple("OK".to_string())
    }

    /// Builds a simple string reply.
    pub fn simple(s: impl Into<String>) -> Self {
        Self::Simple(s.into())
    }

    /// Builds an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    /// Builds a bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    /// Returns the error text if this is an error reply.
    #[must_use]
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Self::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// Encodes a value onto the end of `buf`.
pub fn encode_value(value: &RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            buf.put_u8(b':');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        RespValue::Bulk(data) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        RespValue::NullBulk => buf.put_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            buf.put_u8(b'*');
            buf.put_slice(items.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for item in items {
                encode_value(item, buf);
            }
        }
        RespValue::NullArray => buf.put_slice(b"*-1\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &RespValue) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_value(value, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_encode_simple() {
        assert_eq!(encoded(&RespValue::ok()), b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        assert_eq!(encoded(&RespValue::error("ERR boom")), b"-ERR boom\r\n");
    }

    #[test]
    fn test_encode_integer() {
        assert_eq!(encoded(&RespValue::Integer(-7)), b":-7\r\n");
    }

    #[test]
    fn test_encode_bulk() {
        assert_eq!(encoded(&RespValue::bulk("hello")), b"$5\r\nhello\r\n");
        assert_eq!(encoded(&RespValue::NullBulk), b"$-1\r\n");
    }

    #[test]
    fn test_encode_array() {
        let value = RespValue::Array(vec![
            RespValue::bulk("GET"),
            RespValue::bulk("k"),
        ]);
        assert_eq!(encoded(&value), b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        assert_eq!(encoded(&RespValue::NullArray), b"*-1\r\n");
    }
}
