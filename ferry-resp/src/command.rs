//! Command inspection and control frames.
//!
//! The proxy forwards most commands untouched; it only needs to know the
//! command name, which key decides the route, and whether the command names
//! several keys that may live on different backends. Redirection replies
//! (`MOVED`/`ASK`) are parsed here too.

use bytes::{Bytes, BytesMut};

use crate::value::{encode_value, RespValue};

/// A decoded client command.
///
/// Keeps the raw frame so the proxy can forward it byte-for-byte.
#[derive(Debug, Clone)]
pub struct Command {
    raw: Bytes,
    args: Vec<Bytes>,
    name: String,
}

impl Command {
    /// Builds a command from its decoded parts.
    ///
    /// # Panics
    ///
    /// Panics if `args` is empty; the decoder rejects empty commands.
    #[must_use]
    pub fn from_parts(raw: Bytes, args: Vec<Bytes>) -> Self {
        assert!(!args.is_empty(), "command must have a name");
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        Self { raw, args, name }
    }

    /// Builds a command from argument slices, encoding the raw frame.
    #[must_use]
    pub fn new(parts: &[&[u8]]) -> Self {
        let raw = command_frame(parts);
        let args = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        Self::from_parts(raw, args)
    }

    /// The command name, uppercased.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw frame bytes.
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Consumes the command, returning the raw frame.
    #[must_use]
    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    /// All arguments, command name included.
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The routing key: the first argument after the command name.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.args.get(1).map(|b| &b[..])
    }

    /// For commands that name several keys (`MGET`, `DEL`, `MSET`), returns
    /// all keys in argument order. `None` for single-key commands.
    #[must_use]
    pub fn multi_keys(&self) -> Option<Vec<&[u8]>> {
        match self.name.as_str() {
            "MGET" | "DEL" if self.args.len() > 2 => {
                Some(self.args[1..].iter().map(|b| &b[..]).collect())
            }
            "MSET" if self.args.len() > 3 && self.args.len() % 2 == 1 => {
                Some(self.args[1..].iter().step_by(2).map(|b| &b[..]).collect())
            }
            _ => None,
        }
    }
}

/// Encodes a command frame (array of bulk strings) from argument slices.
#[must_use]
pub fn command_frame(parts: &[&[u8]]) -> Bytes {
    let items = parts
        .iter()
        .map(|p| RespValue::Bulk(Bytes::copy_from_slice(p)))
        .collect();
    let mut buf = BytesMut::new();
    encode_value(&RespValue::Array(items), &mut buf);
    buf.freeze()
}

/// The one-shot `ASKING` frame written before a retried request.
#[must_use]
pub fn asking_frame() -> Bytes {
    Bytes::from_static(b"*1\r\n$6\r\nASKING\r\n")
}

/// The topology query frame.
#[must_use]
pub fn cluster_slots_frame() -> Bytes {
    Bytes::from_static(b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n")
}

/// Which kind of redirection a backend issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `MOVED`: slot ownership has permanently changed.
    Moved,
    /// `ASK`: the slot is migrating; retry once at the target with `ASKING`.
    Ask,
}

/// A parsed redirection reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    /// The redirection kind.
    pub kind: RedirectKind,
    /// The slot named by the reply.
    pub slot: u16,
    /// The target address, `host:port`.
    pub addr: String,
}

impl Redirection {
    /// Parses a redirection out of a reply, if it is one.
    #[must_use]
    pub fn parse(value: &RespValue) -> Option<Self> {
        let text = value.as_error()?;
        let mut parts = text.split_ascii_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot: u16 = parts.next()?.parse().ok()?;
        let addr = parts.next()?.to_string();
        Some(Self { kind, slot, addr })
    }
}
