//! RESP wire codec for the ferry proxy.
//!
//! Implements the request/response serialization spoken on both sides of the
//! proxy: incremental decoding out of a read buffer, value encoding, and the
//! light command inspection the proxy needs (command name, key, multi-key
//! classification, redirection replies).
//!
//! Decoding is incremental in the style of a length-prefixed frame reader:
//! `decode_value` returns `Ok(None)` until a complete value is buffered and
//! never consumes a partial frame.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

mod codec;
mod command;
mod error;
mod value;

pub use codec::{decode_command, decode_value, MAX_ARRAY_LEN, MAX_BULK_BYTES, MAX_DEPTH};
pub use command::{
    asking_frame, cluster_slots_frame, command_frame, Command, RedirectKind, Redirection,
};
pub use error::{RespError, RespResult};
pub use value::{encode_value, RespValue};
