//! Codec error types.

use thiserror::Error;

/// Errors from RESP encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RespError {
    /// The input does not follow the wire protocol.
    #[error("protocol violation: {message}")]
    Syntax {
        /// What was wrong.
        message: String,
    },

    /// A bulk string exceeds the maximum allowed size.
    #[error("bulk string too large: {size} bytes (max {max})")]
    BulkTooLarge {
        /// Declared size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// An array declares more elements than allowed.
    #[error("array too long: {len} elements (max {max})")]
    ArrayTooLong {
        /// Declared length.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Arrays nest deeper than allowed.
    #[error("nesting too deep (max {max})")]
    DepthExceeded {
        /// Maximum allowed depth.
        max: usize,
    },
}

impl RespError {
    /// Builds a syntax error.
    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }
}

/// Result type for codec operations.
pub type RespResult<T> = Result<T, RespError>;
